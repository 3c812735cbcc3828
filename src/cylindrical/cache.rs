use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use super::tables::EofTables;
use crate::error::CacheError;

/// Magic number of the basis cache file.
pub const CACHE_MAGIC: u32 = 0xC0A57A1;

/// Every parameter that determines the table contents. A cached basis is
/// only accepted when all of them match the requested configuration; the
/// conditioning model id is part of the set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheHeader {
    pub mmax: usize,
    pub numx: usize,
    pub numy: usize,
    pub nmax: usize,
    pub norder: usize,
    pub dens: bool,
    pub cmap: i32,
    pub rmin: f64,
    pub rmax: f64,
    pub ascl: f64,
    pub hscl: f64,
    pub model: String,
}

impl CacheHeader {
    fn matches(&self, other: &CacheHeader) -> Result<(), String> {
        macro_rules! check_exact {
            ($field:ident) => {
                if self.$field != other.$field {
                    return Err(format!(
                        "{}: requested {:?}, cached {:?}",
                        stringify!($field),
                        self.$field,
                        other.$field
                    ));
                }
            };
        }
        macro_rules! check_close {
            ($field:ident) => {
                if (self.$field - other.$field).abs() > 1.0e-12 {
                    return Err(format!(
                        "{}: requested {}, cached {}",
                        stringify!($field),
                        self.$field,
                        other.$field
                    ));
                }
            };
        }
        check_exact!(mmax);
        check_exact!(numx);
        check_exact!(numy);
        check_exact!(nmax);
        check_exact!(norder);
        check_exact!(dens);
        check_exact!(cmap);
        check_exact!(model);
        check_close!(rmin);
        check_close!(rmax);
        check_close!(ascl);
        check_close!(hscl);
        Ok(())
    }
}

/// Write the basis atomically: tmp file, fsync, rename. A reader that
/// opens the path after the rename always sees a complete file.
pub fn write_cache(
    path: &Path,
    header: &CacheHeader,
    cylmass: f64,
    time: f64,
    tables: &EofTables,
) -> Result<(), CacheError> {
    let tmp_path: PathBuf = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut out = BufWriter::new(file);
        let yaml = serde_yaml::to_string(header)
            .map_err(|e| CacheError::Corrupt {
                path: path.to_owned(),
                reason: format!("could not serialize header: {e}"),
            })?;
        out.write_all(&CACHE_MAGIC.to_le_bytes())?;
        out.write_all(&(yaml.len() as u64).to_le_bytes())?;
        out.write_all(yaml.as_bytes())?;
        out.write_all(&cylmass.to_le_bytes())?;
        out.write_all(&time.to_le_bytes())?;
        for block in tables.cos.iter().chain(tables.sin.iter()) {
            for function in block {
                for field in function.as_blocks() {
                    for value in field {
                        out.write_all(&value.to_le_bytes())?;
                    }
                }
            }
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    info!("wrote basis cache {:?}", path);
    Ok(())
}

/// Load the basis from a cache file.
///
/// `Ok(None)` signals a parameter mismatch with `strict` off: the caller
/// rebuilds and overwrites. With `strict` on a mismatch is an error, as
/// is any corruption.
pub fn read_cache(
    path: &Path,
    expected: &CacheHeader,
    strict: bool,
) -> Result<Option<(EofTables, f64, f64)>, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        path: path.to_owned(),
        reason,
    };
    let mut input = BufReader::new(File::open(path)?);

    let magic = read_u32(&mut input)?;
    if magic != CACHE_MAGIC {
        return Err(corrupt(format!(
            "bad magic {magic:#x}, expected {CACHE_MAGIC:#x}"
        )));
    }
    let yaml_len = read_u64(&mut input)? as usize;
    if yaml_len > 1 << 20 {
        return Err(corrupt(format!("implausible header length {yaml_len}")));
    }
    let mut yaml = vec![0u8; yaml_len];
    input.read_exact(&mut yaml)?;
    let header: CacheHeader = serde_yaml::from_slice(&yaml)
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;

    if let Err(reason) = expected.matches(&header) {
        if strict {
            return Err(CacheError::Mismatch(reason));
        }
        warn!("basis cache {:?} does not match, rebuilding: {}", path, reason);
        return Ok(None);
    }

    let cylmass = read_f64(&mut input)?;
    let time = read_f64(&mut input)?;

    let points = (header.numx + 1) * (header.numy + 1);
    let mut tables = EofTables::zeros(header.mmax, header.norder, points, header.dens);
    for block in tables.cos.iter_mut().chain(tables.sin.iter_mut()) {
        for function in block.iter_mut() {
            for field in function.as_blocks_mut() {
                read_f64_slice(&mut input, field)?;
            }
        }
    }
    Ok(Some((tables, cylmass, time)))
}

fn read_u32(input: &mut impl Read) -> Result<u32, CacheError> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(input: &mut impl Read) -> Result<u64, CacheError> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(input: &mut impl Read) -> Result<f64, CacheError> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_f64_slice(input: &mut impl Read, out: &mut [f64]) -> Result<(), CacheError> {
    let mut buf = vec![0u8; out.len() * 8];
    input.read_exact(&mut buf)?;
    for (value, chunk) in out.iter_mut().zip(buf.chunks_exact(8)) {
        *value = f64::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> CacheHeader {
        CacheHeader {
            mmax: 2,
            numx: 8,
            numy: 4,
            nmax: 6,
            norder: 4,
            dens: true,
            cmap: 1,
            rmin: 0.001,
            rmax: 10.0,
            ascl: 1.0,
            hscl: 0.1,
            model: "exponential".into(),
        }
    }

    fn test_tables(header: &CacheHeader) -> EofTables {
        let points = (header.numx + 1) * (header.numy + 1);
        let mut tables = EofTables::zeros(header.mmax, header.norder, points, header.dens);
        let mut counter = 0.0;
        for block in tables.cos.iter_mut().chain(tables.sin.iter_mut()) {
            for function in block.iter_mut() {
                for field in function.as_blocks_mut() {
                    for value in field.iter_mut() {
                        *value = counter;
                        counter += 0.25;
                    }
                }
            }
        }
        tables
    }

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("bfexp-cache-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn cache_round_trip_is_bit_exact() {
        let header = test_header();
        let tables = test_tables(&header);
        let path = scratch_path("roundtrip");
        write_cache(&path, &header, 42.5, 1.25, &tables).unwrap();
        let (loaded, cylmass, time) = read_cache(&path, &header, true).unwrap().unwrap();
        assert_eq!(loaded, tables);
        assert_eq!(cylmass, 42.5);
        assert_eq!(time, 1.25);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn parameter_mismatch_is_strict_error_or_rebuild() {
        let header = test_header();
        let tables = test_tables(&header);
        let path = scratch_path("mismatch");
        write_cache(&path, &header, 1.0, 0.0, &tables).unwrap();

        let mut requested = test_header();
        requested.norder = 5;
        match read_cache(&path, &requested, true) {
            Err(CacheError::Mismatch(_)) => {}
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert!(read_cache(&path, &requested, false).unwrap().is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn model_id_is_checked() {
        let header = test_header();
        let tables = test_tables(&header);
        let path = scratch_path("model");
        write_cache(&path, &header, 1.0, 0.0, &tables).unwrap();
        let mut requested = test_header();
        requested.model = "plummer".into();
        match read_cache(&path, &requested, true) {
            Err(CacheError::Mismatch(reason)) => assert!(reason.contains("model")),
            other => panic!("expected mismatch, got {other:?}"),
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let path = scratch_path("magic");
        std::fs::write(&path, [0u8; 64]).unwrap();
        match read_cache(&path, &test_header(), true) {
            Err(CacheError::Corrupt { .. }) => {}
            other => panic!("expected corrupt, got {other:?}"),
        }
        std::fs::remove_file(&path).unwrap();
    }
}
