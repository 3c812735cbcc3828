mod layout;

use std::f64::consts::PI;

pub use layout::SphericalLayout;

use crate::communication::Communicator;
use crate::diagnostics::DiagnosticCounter;
use crate::error::InvalidBasisParameters;
use crate::math::factorial_ratio;
use crate::math::legendre;
use crate::math::legendre_with_derivative;
use crate::math::sine_cosine;
use crate::math::AngularTables;
use crate::multistep::DifferentialQueue;
use crate::multistep::LevelBuffers;
use crate::pca::CovarianceAccumulator;
use crate::pca::SmootherParameters;
use crate::pca::TkType;
use crate::radial::Field;
use crate::radial::RadialBasis;
use crate::radial::RadialParameters;

/// Positional view of one particle handed to a basis: position relative
/// to the expansion origin, mass, and the stable index (for sub-ensemble
/// assignment).
#[derive(Clone, Copy, Debug)]
pub struct BodyView {
    pub pos: [f64; 3],
    pub mass: f64,
    pub index: u64,
}

/// Fields evaluated at one point, in spherical components:
/// ∂Φ/∂r, ∂Φ/∂θ and ∂Φ/∂φ (not yet divided by the metric factors).
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldPoint {
    pub dens: f64,
    pub pot: f64,
    pub dpot_dr: f64,
    pub dpot_dtheta: f64,
    pub dpot_dphi: f64,
}

#[derive(Clone, Debug)]
pub struct SphericalParameters {
    pub radial: RadialParameters,
    /// Suppress odd `l` harmonics (reflection-symmetric populations).
    pub even_l: bool,
    pub multistep: usize,
    pub smoothing: SmootherParameters,
}

/// Spherical basis expansion: coefficients over (l, m, cos|sin, n),
/// accumulated from particles and evaluated back as density, potential
/// and potential gradients.
pub struct SphericalBasis {
    params: SphericalParameters,
    radial: RadialBasis,
    layout: SphericalLayout,
    levels: LevelBuffers,
    /// Fused coefficients used for evaluation.
    coefs: Vec<f64>,
    queue: DifferentialQueue,
    covariance: Option<CovarianceAccumulator>,
    used: u64,
    out_of_bounds: DiagnosticCounter,
    bad_positions: DiagnosticCounter,
    hazards: DiagnosticCounter,
    clamped_weights: DiagnosticCounter,
}

impl SphericalBasis {
    pub fn new(params: SphericalParameters) -> Result<Self, InvalidBasisParameters> {
        let radial = RadialBasis::new(params.radial.clone())?;
        let layout = SphericalLayout::new(params.radial.lmax, params.radial.nmax);
        let levels = LevelBuffers::new(params.multistep, layout.num_terms());
        let covariance = if params.smoothing.tk_type != TkType::None {
            Some(CovarianceAccumulator::new(
                layout.num_subspaces(),
                params.radial.nmax,
                if params.smoothing.subsamp {
                    params.smoothing.samplesz
                } else {
                    1
                },
                params.smoothing.subsamp,
            ))
        } else {
            None
        };
        Ok(Self {
            coefs: vec![0.0; layout.num_terms()],
            queue: DifferentialQueue::default(),
            covariance,
            used: 0,
            out_of_bounds: DiagnosticCounter::new("spherical accumulation beyond rmax", 1024),
            bad_positions: DiagnosticCounter::new("spherical non-finite position", 64),
            hazards: DiagnosticCounter::new("spherical covariance hazard", 64),
            clamped_weights: DiagnosticCounter::new("spherical smoothing weight clamp", 64),
            params,
            radial,
            layout,
            levels,
        })
    }

    pub fn layout(&self) -> &SphericalLayout {
        &self.layout
    }

    pub fn rmax(&self) -> f64 {
        self.radial.rmax()
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefs
    }

    pub fn radial_basis(&self) -> &RadialBasis {
        &self.radial
    }

    pub fn smoothing_enabled(&self) -> bool {
        self.covariance.is_some()
    }

    pub fn smoothing_interval(&self) -> usize {
        self.params.smoothing.npca.max(1)
    }

    /// Tabulate the fused coefficients as text, one row per radial order
    /// with one column per harmonic slot.
    pub fn dump_coefs_ascii(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        write!(out, "# n |")?;
        for (l, m) in self.layout.harmonics() {
            write!(out, "{:>16}", format!("({l} {m}c)"))?;
            if m > 0 {
                write!(out, "{:>16}", format!("({l} {m}s)"))?;
            }
        }
        writeln!(out)?;
        for n in 0..self.layout.nmax() {
            write!(out, "{:5}", n)?;
            for (l, m) in self.layout.harmonics() {
                let cos = self.coefs[self.layout.index(self.layout.slot(l, m, false), n)];
                write!(out, "{:16.8e}", cos)?;
                if m > 0 {
                    let sin =
                        self.coefs[self.layout.index(self.layout.slot(l, m, true), n)];
                    write!(out, "{:16.8e}", sin)?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Zero the accumulation buffers of every level at or above `mlevel`.
    pub fn setup_accumulation(&mut self, mlevel: usize) {
        self.levels.reset_from(mlevel);
        self.used = 0;
        if let Some(cov) = self.covariance.as_mut() {
            cov.reset();
        }
    }

    /// Sub-step tick: swap level windows that close at `s`.
    pub fn tick(&mut self, s: u64) {
        self.levels.tick(s);
    }

    /// Accumulate a batch of bodies into the level-`mlevel` buffers,
    /// splitting the batch over `nthreads` workers. Per-thread partials
    /// are merged in thread-id order, so the result is deterministic.
    pub fn accumulate(&mut self, bodies: &[BodyView], mlevel: usize, nthreads: usize) {
        let nthreads = nthreads.max(1);
        let chunk = bodies.len().div_ceil(nthreads).max(1);
        let layout = self.layout;
        let radial = &self.radial;
        let even_l = self.params.even_l;
        let with_moments = self.covariance.is_some();
        let samp_t = self
            .covariance
            .as_ref()
            .map(|c| c.samp_t())
            .unwrap_or(1);
        let subsamp = self
            .covariance
            .as_ref()
            .map(|c| c.subsamp())
            .unwrap_or(false);

        struct Partial {
            coefs: Vec<f64>,
            used: u64,
            skipped: u64,
            bad: u64,
            moments: Option<CovarianceAccumulator>,
        }

        let partials: Vec<Partial> = std::thread::scope(|scope| {
            let handles: Vec<_> = bodies
                .chunks(chunk)
                .map(|slice| {
                    scope.spawn(move || {
                        let mut partial = Partial {
                            coefs: vec![0.0; layout.num_terms()],
                            used: 0,
                            skipped: 0,
                            bad: 0,
                            moments: with_moments.then(|| {
                                CovarianceAccumulator::new(
                                    layout.num_subspaces(),
                                    layout.nmax(),
                                    samp_t,
                                    subsamp,
                                )
                            }),
                        };
                        let mut angular = AngularTables::new(layout.lmax());
                        let mut potd =
                            nalgebra::DMatrix::zeros(layout.lmax() + 1, layout.nmax());
                        let mut contrib = vec![0.0; layout.nmax()];
                        for body in slice {
                            accumulate_body(
                                body,
                                radial,
                                layout,
                                even_l,
                                &mut angular,
                                &mut potd,
                                &mut contrib,
                                &mut partial.coefs,
                                partial.moments.as_mut(),
                                &mut partial.used,
                                &mut partial.skipped,
                                &mut partial.bad,
                            );
                        }
                        partial
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let target = self.levels.next_mut(mlevel);
        for partial in partials {
            for (t, p) in target.iter_mut().zip(&partial.coefs) {
                *t += p;
            }
            self.used += partial.used;
            for _ in 0..partial.skipped {
                self.out_of_bounds.record(|| "body outside rmax".into());
            }
            for _ in 0..partial.bad {
                self.bad_positions.record(|| "body position is not finite".into());
            }
            if let (Some(total), Some(partial)) =
                (self.covariance.as_mut(), partial.moments.as_ref())
            {
                total.merge(partial);
            }
        }
    }

    /// All-reduce the active levels so every rank holds identical sums.
    pub fn reduce(
        &mut self,
        mlevel: usize,
        comm_f: &mut Communicator<f64>,
        comm_u: &mut Communicator<u64>,
    ) {
        use crate::communication::SumCommunicator;
        self.levels.reduce_from(mlevel, comm_f);
        self.used = comm_u.collective_sum(&self.used);
        if let Some(cov) = self.covariance.as_mut() {
            cov.reduce(comm_f, comm_u);
        }
    }

    /// Assemble the fused coefficient set for force evaluation at
    /// sub-step `s` with leading level `m_lev`.
    pub fn compute_multistep_coefficients(&mut self, s: u64, m_lev: usize) {
        let mut fused = std::mem::take(&mut self.coefs);
        self.levels.fused(s, m_lev, &mut fused);
        self.coefs = fused;
    }

    /// Apply the smoothing filter to the fused coefficients. All ranks
    /// hold identical statistics after `reduce`, so every rank computes
    /// the same smoothed set without a broadcast.
    pub fn smooth(&mut self) {
        let Some(cov) = self.covariance.as_ref() else {
            return;
        };
        let n_for_snr = if cov.subsamp() {
            cov.samp_t() as f64
        } else {
            cov.used() as f64
        };
        let params = self.params.smoothing.clone();
        let layout = self.layout;
        for (l, m) in layout.subspaces() {
            let Some((mean, covar)) = cov.moments(layout.subspace_index(l, m)) else {
                continue;
            };
            let cos_range = layout.term_range(layout.slot(l, m, false));
            if m == 0 {
                let (_, tail) = self.coefs.split_at_mut(cos_range.start);
                let (cos, _) = tail.split_at_mut(layout.nmax());
                crate::pca::smooth_subspace(
                    &params,
                    &mean,
                    &covar,
                    n_for_snr,
                    &mut [cos],
                    &mut self.hazards,
                    &mut self.clamped_weights,
                );
            } else {
                // Cosine and sine parts share the decomposition.
                let (_, tail) = self.coefs.split_at_mut(cos_range.start);
                let (cos, rest) = tail.split_at_mut(layout.nmax());
                let (sin, _) = rest.split_at_mut(layout.nmax());
                crate::pca::smooth_subspace(
                    &params,
                    &mean,
                    &covar,
                    n_for_snr,
                    &mut [cos, sin],
                    &mut self.hazards,
                    &mut self.clamped_weights,
                );
            }
        }
    }

    /// Queue the differential for a particle moving between levels.
    pub fn multistep_update(&mut self, from: usize, to: usize, body: &BodyView) {
        if !body.has_finite_position() {
            self.bad_positions.record(|| "level update with non-finite position".into());
            return;
        }
        let r = radius(body);
        if r > self.radial.rmax() {
            return;
        }
        let mut delta = vec![0.0; self.layout.num_terms()];
        let mut angular = AngularTables::new(self.layout.lmax());
        let mut potd = nalgebra::DMatrix::zeros(self.layout.lmax() + 1, self.layout.nmax());
        let mut contrib = vec![0.0; self.layout.nmax()];
        let mut used = 0;
        let mut skipped = 0;
        let mut bad = 0;
        accumulate_body(
            body,
            &self.radial,
            self.layout,
            self.params.even_l,
            &mut angular,
            &mut potd,
            &mut contrib,
            &mut delta,
            None,
            &mut used,
            &mut skipped,
            &mut bad,
        );
        self.queue.push(from, to, delta);
    }

    /// Apply queued level changes at the sub-step barrier.
    pub fn multistep_update_finish(&mut self, comm: &mut Communicator<f64>) {
        let mut queue = std::mem::take(&mut self.queue);
        self.levels.apply_queued(&mut queue, comm);
    }

    /// Freeze the level buffers at the end of a run.
    pub fn finalize(&mut self) {
        self.levels.finalize();
    }

    /// Zero all coefficients of radial order `n ≥ cut` in every buffer.
    pub fn restrict_order(&mut self, cut: usize) {
        let layout = self.layout;
        let zero_tail = move |block: &mut [f64]| {
            for slot in 0..layout.num_slots() {
                for n in cut..layout.nmax() {
                    block[layout.index(slot, n)] = 0.0;
                }
            }
        };
        self.levels.for_each_block(zero_tail);
        zero_tail(&mut self.coefs);
    }

    /// Fields at a spherical coordinate point. `r` beyond the table edge
    /// uses the analytic exterior continuation; negative radii are a
    /// caller error.
    pub fn evaluate(
        &self,
        r: f64,
        theta: f64,
        phi: f64,
    ) -> Result<FieldPoint, crate::error::Error> {
        if r < 0.0 {
            return Err(crate::error::Error::InvalidCoordinate(format!(
                "negative radius {r}"
            )));
        }
        let layout = self.layout;
        let rmax = self.radial.rmax();
        let exterior = r > rmax;
        let r_table = if exterior { rmax } else { r };

        let mut angular = AngularTables::new(layout.lmax());
        legendre_with_derivative(
            layout.lmax(),
            theta.cos(),
            &mut angular.legs,
            &mut angular.dlegs,
        );
        sine_cosine(layout.lmax(), phi, &mut angular.cosm, &mut angular.sinm);

        let mut potd = nalgebra::DMatrix::zeros(layout.lmax() + 1, layout.nmax());
        let mut dpot = nalgebra::DMatrix::zeros(layout.lmax() + 1, layout.nmax());
        let mut dend = nalgebra::DMatrix::zeros(layout.lmax() + 1, layout.nmax());
        self.radial.fill(r_table, Field::Potential, &mut potd);
        self.radial.fill(r_table, Field::Force, &mut dpot);
        if !exterior {
            self.radial.fill(r, Field::Density, &mut dend);
        }

        let mut out = FieldPoint::default();
        let sin_theta = theta.sin();

        for (l, m) in layout.harmonics() {
            // (2l+1)/4π (l−m)!/(l+m)! (2−δ_m0): the real-harmonic
            // completeness factor.
            let mut fac = (2 * l + 1) as f64 / (4.0 * PI);
            if m > 0 {
                fac *= 2.0 * factorial_ratio(l, m);
            }
            let legs = angular.legs[(l, m)];
            let dlegs = angular.dlegs[(l, m)];
            let cosm = angular.cosm[m];
            let sinm = angular.sinm[m];

            let cos_base = layout.index(layout.slot(l, m, false), 0);
            let (mut pc, mut dpc, mut dc) = (0.0, 0.0, 0.0);
            for n in 0..layout.nmax() {
                let a = self.coefs[cos_base + n];
                pc += potd[(l, n)] * a;
                dpc += dpot[(l, n)] * a;
                dc += dend[(l, n)] * a;
            }
            let (mut ps, mut dps, mut ds) = (0.0, 0.0, 0.0);
            if m > 0 {
                let sin_base = layout.index(layout.slot(l, m, true), 0);
                for n in 0..layout.nmax() {
                    let a = self.coefs[sin_base + n];
                    ps += potd[(l, n)] * a;
                    dps += dpot[(l, n)] * a;
                    ds += dend[(l, n)] * a;
                }
            }

            let (pc, dpc, ps, dps) = if exterior {
                let f = (rmax / r).powi(l as i32 + 1);
                // The continuation is the pure power law; its radial
                // slope replaces the table derivative.
                let slope = -((l + 1) as f64) / r;
                (pc * f, pc * f * slope, ps * f, ps * f * slope)
            } else {
                (pc, dpc, ps, dps)
            };

            let azim = pc * cosm + ps * sinm;
            let azim_d = dpc * cosm + dps * sinm;
            out.pot += -fac * legs * azim;
            out.dpot_dr += -fac * legs * azim_d;
            // ∂/∂θ acts on P_l^m(cos θ): dP/dθ = −sin θ · dP/dx.
            out.dpot_dtheta += fac * sin_theta * dlegs * azim;
            out.dpot_dphi += -fac * legs * m as f64 * (-pc * sinm + ps * cosm);
            if !exterior {
                out.dens += fac * legs * (dc * cosm + ds * sinm);
            }
        }
        Ok(out)
    }
}

fn radius(body: &BodyView) -> f64 {
    (body.pos[0] * body.pos[0] + body.pos[1] * body.pos[1] + body.pos[2] * body.pos[2])
        .sqrt()
}

impl BodyView {
    pub fn has_finite_position(&self) -> bool {
        self.pos.iter().all(|x| x.is_finite())
    }
}

#[allow(clippy::too_many_arguments)]
fn accumulate_body(
    body: &BodyView,
    radial: &RadialBasis,
    layout: SphericalLayout,
    even_l: bool,
    angular: &mut AngularTables,
    potd: &mut nalgebra::DMatrix<f64>,
    contrib: &mut [f64],
    coefs: &mut [f64],
    mut moments: Option<&mut CovarianceAccumulator>,
    used: &mut u64,
    skipped: &mut u64,
    bad: &mut u64,
) {
    if !body.has_finite_position() {
        *bad += 1;
        return;
    }
    let r = radius(body) + f64::MIN_POSITIVE;
    if r > radial.rmax() {
        *skipped += 1;
        return;
    }
    *used += 1;

    let costh = body.pos[2] / r;
    let phi = body.pos[1].atan2(body.pos[0]);
    legendre(layout.lmax(), costh, &mut angular.legs);
    sine_cosine(layout.lmax(), phi, &mut angular.cosm, &mut angular.sinm);
    radial.fill(r, Field::Potential, potd);

    let fac0 = 4.0 * PI;
    let ensemble = moments
        .as_deref_mut()
        .map(|cov| {
            let e = cov.ensemble(body.index);
            cov.add_particle(e, body.mass);
            e
        })
        .unwrap_or(0);

    for (l, m) in layout.harmonics() {
        if even_l && l % 2 == 1 {
            continue;
        }
        let legs = angular.legs[(l, m)];
        // Cosine part (the only part for m = 0)
        let fac1 = legs * angular.cosm[m];
        let cos_base = layout.index(layout.slot(l, m, false), 0);
        for n in 0..layout.nmax() {
            contrib[n] = potd[(l, n)] * fac1 * body.mass * fac0 / radial.norm(l, n);
            coefs[cos_base + n] += contrib[n];
        }
        if let Some(cov) = moments.as_deref_mut() {
            cov.add_contribution(layout.subspace_index(l, m), ensemble, contrib, body.mass);
        }
        if m > 0 {
            let fac2 = legs * angular.sinm[m];
            let sin_base = layout.index(layout.slot(l, m, true), 0);
            for n in 0..layout.nmax() {
                coefs[sin_base + n] +=
                    potd[(l, n)] * fac2 * body.mass * fac0 / radial.norm(l, n);
            }
        }
    }
}

#[cfg(test)]
mod tests;
