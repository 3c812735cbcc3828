use std::io::Read;
use std::io::Write;

use serde_yaml::Value;

use crate::particle::Particle;

/// Upper bytes of the dump marker; the low four bytes carry the width of
/// the floating-point kind (4 or 8).
const MAGIC_BASE: u64 = 0xadbf_abc0_0000_0000;
const MAGIC_MASK: u64 = 0xffff_ffff_0000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatKind {
    F4,
    F8,
}

impl FloatKind {
    pub fn width(&self) -> u64 {
        match self {
            FloatKind::F4 => 4,
            FloatKind::F8 => 8,
        }
    }

    fn from_width(width: u64) -> Option<Self> {
        match width {
            4 => Some(FloatKind::F4),
            8 => Some(FloatKind::F8),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DumpHeader {
    pub ntot: u32,
    pub ncomp: u32,
    pub time: f64,
}

/// One component's slice of a dump: the info-string metadata and the
/// particle records.
#[derive(Clone, Debug)]
pub struct ComponentStanza {
    pub name: String,
    pub parameters: Value,
    pub bodyfile: String,
    pub force_id: String,
    pub force_parameters: Value,
    pub indexing: bool,
    pub niattr: u32,
    pub ndattr: u32,
    pub particles: Vec<Particle>,
}

impl ComponentStanza {
    fn info_yaml(&self) -> String {
        let mut root = serde_yaml::Mapping::new();
        root.insert("name".into(), Value::String(self.name.clone()));
        root.insert("parameters".into(), self.parameters.clone());
        root.insert("bodyfile".into(), Value::String(self.bodyfile.clone()));
        let mut force = serde_yaml::Mapping::new();
        force.insert("id".into(), Value::String(self.force_id.clone()));
        force.insert("parameters".into(), self.force_parameters.clone());
        root.insert("force".into(), Value::Mapping(force));
        serde_yaml::to_string(&Value::Mapping(root)).unwrap()
    }
}

fn bad_data(reason: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, reason)
}

/// Write one dump. Byte layout is part of the external contract: marker,
/// master header, then per component a header, the YAML info string and
/// the particle records, everything little-endian.
pub fn write_dump(
    out: &mut impl Write,
    time: f64,
    stanzas: &[ComponentStanza],
    kind: FloatKind,
) -> std::io::Result<()> {
    let ntot: u32 = stanzas.iter().map(|s| s.particles.len() as u32).sum();
    out.write_all(&(MAGIC_BASE | kind.width()).to_le_bytes())?;
    out.write_all(&ntot.to_le_bytes())?;
    out.write_all(&(stanzas.len() as u32).to_le_bytes())?;
    out.write_all(&time.to_le_bytes())?;

    for stanza in stanzas {
        let info = stanza.info_yaml();
        out.write_all(&(stanza.particles.len() as u32).to_le_bytes())?;
        out.write_all(&stanza.niattr.to_le_bytes())?;
        out.write_all(&stanza.ndattr.to_le_bytes())?;
        out.write_all(&(info.len() as u32).to_le_bytes())?;
        out.write_all(info.as_bytes())?;

        let mut write_float = |out: &mut dyn Write, v: f64| -> std::io::Result<()> {
            match kind {
                FloatKind::F4 => out.write_all(&(v as f32).to_le_bytes()),
                FloatKind::F8 => out.write_all(&v.to_le_bytes()),
            }
        };

        for p in &stanza.particles {
            if p.iattr.len() != stanza.niattr as usize
                || p.dattr.len() != stanza.ndattr as usize
            {
                return Err(bad_data(format!(
                    "particle {} attribute arity does not match the stanza",
                    p.index
                )));
            }
            if stanza.indexing {
                out.write_all(&p.index.to_le_bytes())?;
            }
            write_float(out, p.mass)?;
            for x in p.pos {
                write_float(out, x)?;
            }
            for v in p.vel {
                write_float(out, v)?;
            }
            write_float(out, p.pot)?;
            for a in &p.iattr {
                out.write_all(&a.to_le_bytes())?;
            }
            for d in &p.dattr {
                write_float(out, *d)?;
            }
        }
    }
    Ok(())
}

/// Read one dump.
pub fn read_dump(input: &mut impl Read) -> std::io::Result<(DumpHeader, Vec<ComponentStanza>)> {
    let marker = read_u64(input)?;
    if marker & MAGIC_MASK != MAGIC_BASE {
        return Err(bad_data(format!("bad dump marker {marker:#018x}")));
    }
    let kind = FloatKind::from_width(marker & !MAGIC_MASK)
        .ok_or_else(|| bad_data(format!("bad float width in marker {marker:#018x}")))?;

    let header = DumpHeader {
        ntot: read_u32(input)?,
        ncomp: read_u32(input)?,
        time: read_f64(input)?,
    };

    let mut stanzas = vec![];
    for _ in 0..header.ncomp {
        let nbod = read_u32(input)?;
        let niattr = read_u32(input)?;
        let ndattr = read_u32(input)?;
        let ninfochar = read_u32(input)?;
        let mut info = vec![0u8; ninfochar as usize];
        input.read_exact(&mut info)?;
        let info: Value = serde_yaml::from_slice(&info)
            .map_err(|e| bad_data(format!("unreadable component info string: {e}")))?;

        let get_str = |key: &str| -> String {
            info.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned()
        };
        let parameters = info.get("parameters").cloned().unwrap_or_default();
        let force = info.get("force").cloned().unwrap_or_default();
        let indexing = parameters
            .get("indexing")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut read_float = |input: &mut dyn Read| -> std::io::Result<f64> {
            match kind {
                FloatKind::F4 => Ok(read_f32(input)? as f64),
                FloatKind::F8 => read_f64(input),
            }
        };

        let mut particles = Vec::with_capacity(nbod as usize);
        for seq in 0..nbod {
            let index = if indexing {
                read_u64(input)?
            } else {
                seq as u64 + 1
            };
            let mass = read_float(input)?;
            let mut pos = [0.0; 3];
            for x in pos.iter_mut() {
                *x = read_float(input)?;
            }
            let mut vel = [0.0; 3];
            for v in vel.iter_mut() {
                *v = read_float(input)?;
            }
            let pot = read_float(input)?;
            let mut particle = Particle::new(index, mass, pos, vel);
            particle.pot = pot;
            particle.iattr = (0..niattr)
                .map(|_| read_i32(input))
                .collect::<Result<_, _>>()?;
            particle.dattr = (0..ndattr)
                .map(|_| read_float(input))
                .collect::<Result<_, _>>()?;
            particles.push(particle);
        }

        stanzas.push(ComponentStanza {
            name: get_str("name"),
            parameters,
            bodyfile: get_str("bodyfile"),
            force_id: force
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
            force_parameters: force.get("parameters").cloned().unwrap_or_default(),
            indexing,
            niattr,
            ndattr,
            particles,
        });
    }
    Ok((header, stanzas))
}

fn read_u32(input: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(input: &mut (impl Read + ?Sized)) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(input: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32(input: &mut (impl Read + ?Sized)) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64(input: &mut (impl Read + ?Sized)) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(indexing: bool) -> ComponentStanza {
        let mut parameters = serde_yaml::Mapping::new();
        parameters.insert("indexing".into(), Value::Bool(indexing));
        parameters.insert("rtrunc".into(), Value::Number(5.0.into()));
        let particles = (0..3)
            .map(|i| {
                let mut p = Particle::new(
                    i + 10,
                    0.5 + i as f64,
                    [i as f64, 0.25, -1.0],
                    [0.0, 1.0, 2.0],
                );
                p.pot = -0.75;
                p.iattr = vec![i as i32];
                p.dattr = vec![1.5, -2.5];
                p
            })
            .collect();
        ComponentStanza {
            name: "disk".into(),
            parameters: Value::Mapping(parameters),
            bodyfile: "disk.bods".into(),
            force_id: "cylinder".into(),
            force_parameters: Value::Null,
            indexing,
            niattr: 1,
            ndattr: 2,
            particles,
        }
    }

    #[test]
    fn round_trip_double_precision() {
        let stanzas = vec![stanza(true)];
        let mut buffer = vec![];
        write_dump(&mut buffer, 2.5, &stanzas, FloatKind::F8).unwrap();
        let (header, read) = read_dump(&mut buffer.as_slice()).unwrap();
        assert_eq!(header.time, 2.5);
        assert_eq!(header.ntot, 3);
        assert_eq!(header.ncomp, 1);
        assert_eq!(read[0].name, "disk");
        assert_eq!(read[0].force_id, "cylinder");
        assert_eq!(read[0].particles.len(), 3);
        for (a, b) in stanzas[0].particles.iter().zip(&read[0].particles) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.mass, b.mass);
            assert_eq!(a.pos, b.pos);
            assert_eq!(a.vel, b.vel);
            assert_eq!(a.pot, b.pot);
            assert_eq!(a.iattr, b.iattr);
            assert_eq!(a.dattr, b.dattr);
        }
    }

    #[test]
    fn round_trip_single_precision_narrows() {
        let stanzas = vec![stanza(false)];
        let mut buffer = vec![];
        write_dump(&mut buffer, 0.0, &stanzas, FloatKind::F4).unwrap();
        let (_, read) = read_dump(&mut buffer.as_slice()).unwrap();
        // Without indexing the reader assigns sequence numbers.
        assert_eq!(read[0].particles[0].index, 1);
        for (a, b) in stanzas[0].particles.iter().zip(&read[0].particles) {
            assert_eq!(a.mass as f32, b.mass as f32);
            assert_eq!(b.mass, (a.mass as f32) as f64);
        }
    }

    #[test]
    fn marker_width_is_validated() {
        let mut buffer = vec![];
        write_dump(&mut buffer, 0.0, &[stanza(true)], FloatKind::F8).unwrap();
        // Corrupt the width nibble.
        buffer[0] = 7;
        assert!(read_dump(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn attribute_arity_mismatch_is_rejected() {
        let mut bad = stanza(true);
        bad.particles[1].iattr.clear();
        let mut buffer = vec![];
        assert!(write_dump(&mut buffer, 0.0, &[bad], FloatKind::F8).is_err());
    }
}
