use super::*;
use crate::communication::build_local_communicators;
use crate::communication::ExchangeCommunicator;
use crate::component::load_balance::distribution_targets;
use crate::config::ComponentParams;
use crate::force::Force;
use crate::particle::BodyRecord;
use crate::pca::SmootherParameters;
use crate::radial::CoordMap;
use crate::radial::Interpolation;
use crate::radial::RadialParameters;
use crate::spherical::SphericalBasis;
use crate::spherical::SphericalParameters;

fn test_force(multistep: usize) -> Force {
    Force::Spherical(
        SphericalBasis::new(SphericalParameters {
            radial: RadialParameters {
                lmax: 0,
                nmax: 4,
                numr: 64,
                rmin: 0.01,
                rmax: 10.0,
                cmap: CoordMap::Rational,
                scale: 1.0,
                interp: Interpolation::Linear,
            },
            even_l: false,
            multistep,
            smoothing: SmootherParameters::default(),
        })
        .unwrap(),
    )
}

fn test_component(multistep: usize, params: ComponentParams) -> Component {
    Component::new("halo".into(), params, test_force(multistep), multistep, 1)
}

fn ring(n: usize, radius: f64) -> Vec<Particle> {
    (0..n)
        .map(|i| {
            let phi = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            Particle::new(
                i as u64 + 1,
                1.0 / n as f64,
                [radius * phi.cos(), radius * phi.sin(), 0.0],
                [0.0, 0.0, 0.0],
            )
        })
        .collect()
}

#[test]
fn level_lists_track_particles() {
    let mut component = test_component(2, ComponentParams::default());
    let mut particles = ring(10, 1.0);
    particles[3].level = 2;
    particles[7].level = 1;
    component.nbodies_total = 10;
    component.adopt_particles(particles);
    assert_eq!(component.levlist(0).len(), 8);
    assert_eq!(component.levlist(1).len(), 1);
    assert_eq!(component.levlist(2).len(), 1);
    let total: usize = (0..=2).map(|l| component.levlist(l).len()).sum();
    assert_eq!(total, component.num_local());
}

#[test]
#[should_panic(expected = "invalid level")]
fn invalid_level_is_fatal() {
    let mut component = test_component(1, ComponentParams::default());
    let mut particles = ring(2, 1.0);
    particles[0].level = 5;
    component.adopt_particles(particles);
}

#[test]
fn frozen_particles_do_not_contribute_but_remain() {
    let params: ComponentParams =
        serde_yaml::from_str("rtrunc: 2.0").unwrap();
    let mut component = test_component(0, params);
    let mut particles = ring(4, 1.0);
    particles.push(Particle::new(99, 1.0, [5.0, 0.0, 0.0], [0.0, 0.0, 0.0]));
    component.nbodies_total = 5;
    component.adopt_particles(particles);
    let bodies = component.bodies_at_level(0);
    assert_eq!(bodies.len(), 4, "body beyond rtrunc is frozen");
    assert_eq!(component.num_local(), 5, "frozen body still owned");
}

#[test]
fn escape_flagging_is_permanent_and_updates_the_com_system() {
    let params: ComponentParams =
        serde_yaml::from_str("rcom: 2.0\nkeypos: 0\ncom: true").unwrap();
    let mut component = test_component(0, params);
    let mut particles = ring(8, 1.0);
    for p in particles.iter_mut() {
        p.iattr = vec![0];
    }
    // Light enough that it barely shifts the initial center.
    particles.push({
        let mut p = Particle::new(100, 0.01, [4.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        p.iattr = vec![0];
        p
    });
    component.nbodies_total = 9;
    component.adopt_particles(particles);

    let mut comm_f = build_local_communicators::<f64>(1).remove(0);
    component.initialize_com_system(&mut comm_f);
    let mass_before = component.mtot0;
    component.fix_positions(0, &mut comm_f);
    assert_eq!(component.escaped_count(), 1);
    assert!(component.mtot0 < mass_before);
    assert_eq!(component.particle(100).unwrap().iattr[0], 1);
    // A second pass does not flag it again.
    component.fix_positions(0, &mut comm_f);
    assert_eq!(component.escaped_count(), 1);
}

#[test]
fn distribution_targets_cover_the_population() {
    let (index, table) = distribution_targets(10_000, &[0.1, 0.2, 0.3, 0.4], 4);
    assert_eq!(index[3], 10_000);
    assert_eq!(table.iter().sum::<u64>(), 10_000);
    for (n, t) in table.iter().enumerate() {
        let ideal = [1000.0, 2000.0, 3000.0, 4000.0][n];
        assert!((*t as f64 - ideal).abs() <= 1.0, "rank {n}: {t} vs {ideal}");
    }
}

#[cfg(feature = "local")]
#[test]
fn load_balance_conserves_bodies_and_mass() {
    let num_ranks = 4;
    let total = 10_000u64;
    let rates = [0.1, 0.2, 0.3, 0.4];

    let comm_body = build_local_communicators::<BodyRecord>(num_ranks);
    let comm_f = build_local_communicators::<f64>(num_ranks);
    let comm_i = build_local_communicators::<i64>(num_ranks);

    let handles: Vec<_> = comm_body
        .into_iter()
        .zip(comm_f)
        .zip(comm_i)
        .enumerate()
        .map(|(rank, ((comm_body, mut comm_f), mut comm_i))| {
            std::thread::spawn(move || {
                let mut comm_body = ExchangeCommunicator::new(comm_body);
                let params: ComponentParams =
                    serde_yaml::from_str("indexing: true").unwrap();
                let mut component = Component::new(
                    "halo".into(),
                    params,
                    test_force(0),
                    0,
                    num_ranks,
                );
                component.nbodies_total = total;
                // Start from a uniform split.
                component.setup_distribution(&[], num_ranks);
                let begin = if rank == 0 {
                    0
                } else {
                    component.nbodies_index[rank - 1]
                };
                let end = component.nbodies_index[rank];
                // Masses are exact multiples of 2⁻², so sums are exact in
                // any order and the conservation check can be bitwise.
                let mine: Vec<Particle> = (begin..end)
                    .map(|i| {
                        Particle::new(
                            i + 1,
                            (i % 4 + 1) as f64 * 0.25,
                            [0.1, 0.2, 0.3],
                            [0.0, 0.0, 0.0],
                        )
                    })
                    .collect();
                component.adopt_particles(mine);

                component.load_balance(&rates, &mut comm_body, &mut comm_f, &mut comm_i);

                let indices: Vec<u64> =
                    component.particles().map(|p| p.index).collect();
                (
                    component.num_local() as u64,
                    component.local_mass(),
                    indices,
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let (expected_index, expected_table) = distribution_targets(total, &rates, num_ranks);

    let mut all_indices = vec![];
    let mut total_mass = 0.0;
    for (rank, (count, mass, indices)) in results.iter().enumerate() {
        assert!(
            (*count as i64 - expected_table[rank] as i64).abs() <= 1,
            "rank {rank}: {count} vs {}",
            expected_table[rank]
        );
        total_mass += mass;
        all_indices.extend(indices.iter().copied());
        let begin = if rank == 0 {
            0
        } else {
            expected_index[rank - 1]
        };
        for (offset, index) in indices.iter().enumerate() {
            assert_eq!(*index, begin + offset as u64 + 1);
        }
    }
    all_indices.sort_unstable();
    all_indices.dedup();
    assert_eq!(all_indices.len() as u64, total, "an index was lost or duplicated");
    let exact: f64 = (0..total).map(|i| (i % 4 + 1) as f64 * 0.25).sum();
    assert_eq!(total_mass, exact, "mass must be preserved exactly");
}
