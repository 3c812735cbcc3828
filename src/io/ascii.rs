use std::io::BufRead;

use crate::particle::Particle;

/// Read an ASCII body table: a header line `nbod niattr ndattr`, then one
/// line per body with `mass x y z u v w` followed by the integer and
/// double attributes. Indices are assigned sequentially from 1.
pub fn read_ascii_bodies(input: &mut impl BufRead) -> std::io::Result<Vec<Particle>> {
    let bad = |reason: String| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, reason)
    };

    let mut header = String::new();
    input.read_line(&mut header)?;
    let mut fields = header.split_whitespace();
    let nbod: usize = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| bad("missing body count in header".into()))?;
    let niattr: usize = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| bad("missing integer attribute count in header".into()))?;
    let ndattr: usize = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| bad("missing double attribute count in header".into()))?;

    let mut particles = Vec::with_capacity(nbod);
    let mut line = String::new();
    for seq in 0..nbod {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Err(bad(format!("body file ends after {seq} of {nbod} rows")));
        }
        let mut fields = line.split_whitespace();
        let mut next = |what: &str| -> std::io::Result<f64> {
            fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| bad(format!("row {}: missing {what}", seq + 1)))
        };
        let mass = next("mass")?;
        let pos = [next("x")?, next("y")?, next("z")?];
        let vel = [next("u")?, next("v")?, next("w")?];
        let mut particle = Particle::new(seq as u64 + 1, mass, pos, vel);
        for _ in 0..niattr {
            particle.iattr.push(next("integer attribute")? as i32);
        }
        for _ in 0..ndattr {
            particle.dattr.push(next("double attribute")?);
        }
        particles.push(particle);
    }
    Ok(particles)
}

#[cfg(test)]
mod tests {
    use super::read_ascii_bodies;

    #[test]
    fn reads_bodies_with_attributes() {
        let text = "\
3 1 2
1.0  0.5 0.0 0.0  0.0 1.0 0.0  7  0.1 0.2
1.0  0.0 0.5 0.0  -1.0 0.0 0.0  8  0.3 0.4
0.5  0.0 0.0 0.5  0.0 0.0 0.0  9  0.5 0.6
";
        let bodies = read_ascii_bodies(&mut text.as_bytes()).unwrap();
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0].index, 1);
        assert_eq!(bodies[2].mass, 0.5);
        assert_eq!(bodies[1].iattr, vec![8]);
        assert_eq!(bodies[2].dattr, vec![0.5, 0.6]);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let text = "2 0 0\n1.0 0.0 0.0 0.0 0.0 0.0 0.0\n";
        assert!(read_ascii_bodies(&mut text.as_bytes()).is_err());
    }
}
