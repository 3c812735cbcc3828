use super::*;
use crate::config::SimulationConfig;
use crate::particle::Particle;

fn scratch_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("bfexp-sim-test-{}-{}", std::process::id(), name));
    path
}

/// A cold Plummer-ish ball as an ASCII body table.
fn write_body_file(path: &Path, n: usize) {
    use std::io::Write;
    let mut out = std::fs::File::create(path).unwrap();
    writeln!(out, "{n} 0 0").unwrap();
    for i in 0..n {
        // A deterministic low-discrepancy shell filling.
        let u = (i as f64 + 0.5) / n as f64;
        let r = 0.2 + 1.2 * u;
        let theta = (1.0 - 2.0 * u).acos();
        let phi = 2.0 * std::f64::consts::PI * (i as f64 * 0.618_033_988_75).fract();
        let (st, ct) = (theta.sin(), theta.cos());
        let v = 0.3 * (1.0 - u);
        writeln!(
            out,
            "{:.12e} {:.12e} {:.12e} {:.12e} {:.12e} {:.12e} {:.12e}",
            1.0 / n as f64,
            r * st * phi.cos(),
            r * st * phi.sin(),
            r * ct,
            -v * phi.sin(),
            v * phi.cos(),
            0.0,
        )
        .unwrap();
    }
}

fn halo_config(bodyfile: &Path, multistep: usize, nsteps: usize) -> SimulationConfig {
    let text = format!(
        "
simulation:
  nsteps: {nsteps}
  dtime: 0.01
  multistep: {multistep}
  nthreads: 2
components:
  - name: halo
    bodyfile: {}
    force:
      id: sphereSL
      parameters:
        Lmax: 2
        nmax: 6
        numr: 64
        rmin: 0.01
        rmax: 4.0
",
        bodyfile.display()
    );
    SimulationConfig::from_str(&text, &[]).unwrap()
}

fn single_rank_sim(config: &SimulationConfig) -> Simulation {
    let comms = Comms::local_set(1).remove(0);
    Simulation::new(config, comms).unwrap()
}

#[test]
fn a_short_run_stays_finite_and_advances_time() {
    let bodyfile = scratch_path("run.bods");
    write_body_file(&bodyfile, 200);
    let config = halo_config(&bodyfile, 1, 3);
    let mut sim = single_rank_sim(&config);
    sim.run();
    assert_eq!(sim.context.step, 3);
    assert!((sim.context.tnow - 0.03).abs() < 1e-12);
    let mut mean_pot = 0.0;
    for p in sim.components[0].particles() {
        assert!(p.has_finite_position());
        assert!(p.vel.iter().all(|v| v.is_finite()));
        assert!(p.pot.is_finite());
        mean_pot += p.pot;
    }
    mean_pot /= sim.components[0].num_local() as f64;
    assert!(mean_pot < 0.0, "mean potential should be bound, got {mean_pot}");
    std::fs::remove_file(&bodyfile).unwrap();
}

#[test]
fn identical_runs_are_bit_identical() {
    let bodyfile = scratch_path("det.bods");
    write_body_file(&bodyfile, 120);
    let config = halo_config(&bodyfile, 0, 2);

    let collect = |config: &SimulationConfig| -> Vec<(u64, [f64; 3], [f64; 3])> {
        let mut sim = single_rank_sim(config);
        sim.run();
        sim.components[0]
            .particles()
            .map(|p| (p.index, p.pos, p.vel))
            .collect()
    };
    let first = collect(&config);
    let second = collect(&config);
    assert_eq!(first, second);
    std::fs::remove_file(&bodyfile).unwrap();
}

#[test]
fn multistep_run_keeps_levels_in_range() {
    let bodyfile = scratch_path("levels.bods");
    write_body_file(&bodyfile, 150);
    let config = halo_config(&bodyfile, 2, 2);
    let mut sim = single_rank_sim(&config);
    sim.run();
    let component = &sim.components[0];
    let mut seen = 0;
    for level in 0..=2 {
        seen += component.levlist(level).len();
        for index in component.levlist(level) {
            assert_eq!(component.particle(*index).unwrap().level, level);
        }
    }
    assert_eq!(seen, component.num_local());
    std::fs::remove_file(&bodyfile).unwrap();
}

#[test]
fn checkpoint_round_trips_through_psp() {
    let bodyfile = scratch_path("ckpt.bods");
    write_body_file(&bodyfile, 80);
    let config = halo_config(&bodyfile, 0, 1);
    let mut sim = single_rank_sim(&config);
    sim.run();
    let dump = scratch_path("ckpt.psp");
    sim.write_checkpoint(&dump).unwrap();

    let mut reader = std::io::BufReader::new(std::fs::File::open(&dump).unwrap());
    let (header, stanzas) = crate::io::read_dump(&mut reader).unwrap();
    assert_eq!(header.ncomp, 1);
    assert_eq!(header.ntot, 80);
    assert!((header.time - sim.context.tnow).abs() < 1e-15);
    assert_eq!(stanzas[0].name, "halo");
    assert_eq!(stanzas[0].particles.len(), 80);
    std::fs::remove_file(&bodyfile).unwrap();
    std::fs::remove_file(&dump).unwrap();
}

#[test]
fn desired_level_tracks_dynamics() {
    let slow = Particle::new(1, 1.0, [1.0, 0.0, 0.0], [1.0e-4, 0.0, 0.0]);
    let mut fast = Particle::new(2, 1.0, [0.05, 0.0, 0.0], [3.0, 0.0, 0.0]);
    fast.acc = [50.0, 0.0, 0.0];
    let multistep = 4;
    let coarse = desired_level(&slow, 0.01, multistep);
    let fine = desired_level(&fast, 0.01, multistep);
    assert!(coarse <= fine);
    assert!(fine <= multistep);
    assert_eq!(desired_level(&slow, 1.0e-9, multistep), 0);
}
