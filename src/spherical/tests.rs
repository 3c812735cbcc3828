use super::*;
use crate::pca::SmootherParameters;
use crate::radial::CoordMap;
use crate::radial::Interpolation;
use crate::radial::RadialParameters;

fn monopole_params() -> SphericalParameters {
    SphericalParameters {
        radial: RadialParameters {
            lmax: 0,
            nmax: 10,
            numr: 200,
            rmin: 0.01,
            rmax: 2.0,
            cmap: CoordMap::Rational,
            scale: 0.5,
            interp: Interpolation::Linear,
        },
        even_l: false,
        multistep: 0,
        smoothing: SmootherParameters::default(),
    }
}

fn single_body() -> BodyView {
    BodyView {
        pos: [0.5, 0.0, 0.0],
        mass: 1.0,
        index: 1,
    }
}

#[test]
fn monopole_potential_of_a_point_mass() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);
    basis.compute_multistep_coefficients(0, 0);
    assert_eq!(basis.used(), 1);

    // Outside the particle's radius the monopole is −mass/r.
    let outer = basis.evaluate(1.0, std::f64::consts::FRAC_PI_2, 0.0).unwrap();
    assert!(outer.pot < 0.0);
    assert!(
        (outer.pot + 1.0).abs() < 0.1,
        "potential at r=1 was {}, expected about -1",
        outer.pot
    );

    // The vacuum region decays as 1/r: r·Φ is constant there.
    let farther = basis.evaluate(1.5, std::f64::consts::FRAC_PI_2, 0.0).unwrap();
    let ratio = (farther.pot * 1.5) / (outer.pot * 1.0);
    assert!(
        (ratio - 1.0).abs() < 0.1,
        "r·Φ not constant in vacuum: ratio {ratio}"
    );

    // Inside the particle's radius the potential flattens; it must stay
    // bounded by the value at the shell.
    let inner = basis.evaluate(0.1, std::f64::consts::FRAC_PI_2, 0.0).unwrap();
    assert!(inner.pot < 0.0);
    assert!(inner.pot.abs() >= outer.pot.abs() * 0.9);
}

#[test]
fn exterior_continuation_beyond_rmax() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);
    basis.compute_multistep_coefficients(0, 0);

    let at_edge = basis.evaluate(2.0, 1.0, 0.5).unwrap();
    let outside = basis.evaluate(4.0, 1.0, 0.5).unwrap();
    // l = 0: potential continues as Φ(rmax)·rmax/r, density vanishes.
    assert!((outside.pot - at_edge.pot * 0.5).abs() < 1e-10 * at_edge.pot.abs());
    assert_eq!(outside.dens, 0.0);
    // Radial slope of the continuation: dΦ/dr = −Φ/r.
    assert!(
        (outside.dpot_dr + outside.pot / 4.0).abs() < 1e-10 * outside.pot.abs()
    );
}

#[test]
fn negative_radius_is_rejected() {
    let basis = SphericalBasis::new(monopole_params()).unwrap();
    assert!(basis.evaluate(-0.5, 1.0, 0.0).is_err());
}

#[test]
fn non_finite_positions_are_skipped_not_fatal() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    let bodies = [
        single_body(),
        BodyView {
            pos: [f64::NAN, 0.0, 0.0],
            mass: 1.0,
            index: 2,
        },
    ];
    basis.accumulate(&bodies, 0, 1);
    basis.compute_multistep_coefficients(0, 0);
    assert_eq!(basis.used(), 1);
    assert!(basis.coefficients().iter().all(|c| c.is_finite()));
}

#[test]
fn bodies_beyond_rmax_are_silently_skipped() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    let bodies = [
        single_body(),
        BodyView {
            pos: [5.0, 0.0, 0.0],
            mass: 10.0,
            index: 3,
        },
    ];
    basis.accumulate(&bodies, 0, 1);
    assert_eq!(basis.used(), 1);
}

#[test]
fn coefficient_power_grows_with_accumulated_mass() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    let mut previous = 0.0;
    for batch in 0..4 {
        basis.accumulate(&[single_body()], 0, 1);
        basis.compute_multistep_coefficients(0, 0);
        let power: f64 = basis.coefficients().iter().map(|c| c * c).sum();
        assert!(
            power > previous,
            "batch {batch}: power {power} did not grow past {previous}"
        );
        previous = power;
    }
}

#[test]
fn accumulation_is_deterministic_for_a_fixed_thread_count() {
    use rand::Rng;
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let bodies: Vec<BodyView> = (0..257)
        .map(|i| BodyView {
            pos: [
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ],
            mass: rng.gen_range(0.5..1.5),
            index: i,
        })
        .collect();

    let mut params = monopole_params();
    params.radial.lmax = 2;
    let run = |bodies: &[BodyView]| {
        let mut basis = SphericalBasis::new(params.clone()).unwrap();
        basis.setup_accumulation(0);
        basis.accumulate(bodies, 0, 3);
        basis.compute_multistep_coefficients(0, 0);
        basis.coefficients().to_vec()
    };
    let first = run(&bodies);
    let second = run(&bodies);
    assert_eq!(first, second, "same input and thread count must agree bitwise");
}

#[test]
fn smoothing_disabled_leaves_coefficients_untouched() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);
    basis.compute_multistep_coefficients(0, 0);
    let before = basis.coefficients().to_vec();
    basis.smooth();
    assert_eq!(basis.coefficients(), &before[..]);
}

#[test]
fn restrict_order_zeroes_the_tail() {
    let mut basis = SphericalBasis::new(monopole_params()).unwrap();
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);
    basis.compute_multistep_coefficients(0, 0);
    basis.restrict_order(4);
    let layout = *basis.layout();
    for slot in 0..layout.num_slots() {
        for n in 0..layout.nmax() {
            let value = basis.coefficients()[layout.index(slot, n)];
            if n >= 4 {
                assert_eq!(value, 0.0);
            }
        }
    }
    // Leading orders survive.
    assert!(basis.coefficients()[layout.index(0, 0)] != 0.0);
}

#[cfg(feature = "local")]
#[test]
fn reduction_yields_identical_coefficients_on_all_ranks() {
    use crate::communication::build_local_communicators;
    use rand::Rng;
    use rand::SeedableRng;

    let num_ranks = 2;
    let comm_f = build_local_communicators::<f64>(num_ranks);
    let comm_u = build_local_communicators::<u64>(num_ranks);
    let handles: Vec<_> = comm_f
        .into_iter()
        .zip(comm_u)
        .enumerate()
        .map(|(rank, (mut comm_f, mut comm_u))| {
            std::thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(100 + rank as u64);
                let bodies: Vec<BodyView> = (0..1000)
                    .map(|i| BodyView {
                        pos: [
                            rng.gen_range(-1.5..1.5),
                            rng.gen_range(-1.5..1.5),
                            rng.gen_range(-1.5..1.5),
                        ],
                        mass: rng.gen_range(0.1..1.0),
                        index: (rank * 1000 + i) as u64,
                    })
                    .collect();
                let mut params = monopole_params();
                params.radial.lmax = 1;
                let mut basis = SphericalBasis::new(params).unwrap();
                basis.setup_accumulation(0);
                basis.accumulate(&bodies, 0, 2);
                basis.reduce(0, &mut comm_f, &mut comm_u);
                basis.compute_multistep_coefficients(0, 0);
                basis.coefficients().to_vec()
            })
        })
        .collect();
    let results: Vec<Vec<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], results[1], "ranks disagree after reduction");
}

#[test]
fn ascii_coefficient_dump_lists_every_slot() {
    let mut params = monopole_params();
    params.radial.lmax = 1;
    let mut basis = SphericalBasis::new(params).unwrap();
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);
    basis.compute_multistep_coefficients(0, 0);
    let mut buffer = vec![];
    basis.dump_coefs_ascii(&mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    assert!(text.contains("(0 0c)"));
    assert!(text.contains("(1 1c)"));
    assert!(text.contains("(1 1s)"));
    // Header plus one row per radial order.
    assert_eq!(text.lines().count(), 1 + basis.layout().nmax());
}

#[test]
fn multistep_fusion_is_continuous_at_a_level_swap() {
    let mut params = monopole_params();
    params.multistep = 1;
    let mut basis = SphericalBasis::new(params).unwrap();

    // Accumulate at level 0 only, over its first window.
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);
    basis.tick(1);
    basis.tick(2);
    basis.setup_accumulation(0);
    basis.accumulate(&[single_body()], 0, 1);

    basis.compute_multistep_coefficients(4, 1);
    let before = basis.coefficients().to_vec();
    basis.tick(3);
    basis.tick(4);
    basis.compute_multistep_coefficients(4, 1);
    let after = basis.coefficients().to_vec();
    for (b, a) in before.iter().zip(&after) {
        assert!((b - a).abs() <= 1e-12 * b.abs().max(1.0));
    }
}
