use std::io::Read;
use std::io::Write;

/// One coefficient dump: cosine vectors for `m ∈ [0, mmax]`, sine
/// vectors for `m ≥ 1`, each of `nmax` doubles.
#[derive(Clone, Debug, PartialEq)]
pub struct CoefDump {
    pub time: f64,
    pub mmax: i32,
    pub nmax: i32,
    pub cos: Vec<Vec<f64>>,
    pub sin: Vec<Vec<f64>>,
}

pub fn write_coefficients(out: &mut impl Write, dump: &CoefDump) -> std::io::Result<()> {
    assert_eq!(dump.cos.len(), dump.mmax as usize + 1);
    assert_eq!(dump.sin.len(), dump.mmax as usize);
    out.write_all(&dump.time.to_le_bytes())?;
    out.write_all(&dump.mmax.to_le_bytes())?;
    out.write_all(&dump.nmax.to_le_bytes())?;
    for block in dump.cos.iter().chain(dump.sin.iter()) {
        assert_eq!(block.len(), dump.nmax as usize);
        for value in block {
            out.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(())
}

pub fn read_coefficients(input: &mut impl Read) -> std::io::Result<CoefDump> {
    let mut f8 = [0u8; 8];
    let mut f4 = [0u8; 4];
    input.read_exact(&mut f8)?;
    let time = f64::from_le_bytes(f8);
    input.read_exact(&mut f4)?;
    let mmax = i32::from_le_bytes(f4);
    input.read_exact(&mut f4)?;
    let nmax = i32::from_le_bytes(f4);
    if mmax < 0 || nmax < 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("negative dimensions in coefficient header: {mmax}, {nmax}"),
        ));
    }
    let mut read_block = |input: &mut dyn Read| -> std::io::Result<Vec<f64>> {
        let mut block = vec![0.0; nmax as usize];
        for value in block.iter_mut() {
            let mut buf = [0u8; 8];
            input.read_exact(&mut buf)?;
            *value = f64::from_le_bytes(buf);
        }
        Ok(block)
    };
    let cos = (0..=mmax)
        .map(|_| read_block(input))
        .collect::<Result<_, _>>()?;
    let sin = (1..=mmax)
        .map(|_| read_block(input))
        .collect::<Result<_, _>>()?;
    Ok(CoefDump {
        time,
        mmax,
        nmax,
        cos,
        sin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coefficient_file_round_trips() {
        let dump = CoefDump {
            time: 1.5,
            mmax: 2,
            nmax: 3,
            cos: vec![
                vec![1.0, 2.0, 3.0],
                vec![4.0, 5.0, 6.0],
                vec![7.0, 8.0, 9.0],
            ],
            sin: vec![vec![-1.0, -2.0, -3.0], vec![-4.0, -5.0, -6.0]],
        };
        let mut buffer = vec![];
        write_coefficients(&mut buffer, &dump).unwrap();
        assert_eq!(
            buffer.len(),
            8 + 4 + 4 + (3 + 2) * 3 * 8,
            "header plus five blocks of three doubles"
        );
        let read = read_coefficients(&mut buffer.as_slice()).unwrap();
        assert_eq!(read, dump);
    }
}
