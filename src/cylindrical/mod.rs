mod cache;
mod eof;
mod tables;
mod target;

use std::path::PathBuf;

pub use cache::CacheHeader;
pub use cache::CACHE_MAGIC;
pub use tables::CylGrid;
pub use tables::EofTables;
pub use target::DiskModel;

use log::info;

use crate::communication::BroadcastCommunicator;
use crate::communication::Communicator;
use crate::communication::SizedCommunicator;
use crate::communication::SumCommunicator;
use crate::diagnostics::DiagnosticCounter;
use crate::error::CacheError;
use crate::error::Error;
use crate::error::InvalidBasisParameters;
use crate::math::sine_cosine;
use crate::multistep::DifferentialQueue;
use crate::multistep::LevelBuffers;
use crate::pca::CovarianceAccumulator;
use crate::pca::SmootherParameters;
use crate::pca::TkType;
use crate::radial::CoordMap;
use crate::radial::Interpolation;
use crate::radial::RadialBasis;
use crate::radial::RadialParameters;
use crate::spherical::BodyView;

#[derive(Clone, Debug)]
pub struct CylindricalParameters {
    pub mmax: usize,
    pub norder: usize,
    pub numx: usize,
    pub numy: usize,
    /// Underlying spherical basis used to condition the EOF.
    pub lmax: usize,
    pub nmax: usize,
    pub numr: usize,
    /// Radial extent in units of `ascale`.
    pub rmin: f64,
    pub rmax: f64,
    pub ascale: f64,
    pub hscale: f64,
    pub cmap: CoordMap,
    pub dens: bool,
    pub model: DiskModel,
    /// Quadrature orders of the overlap integral.
    pub eof_numr: usize,
    pub eof_numt: usize,
    pub eof_nump: usize,
    pub cache_file: Option<PathBuf>,
    /// Fail instead of rebuilding when the cache disagrees.
    pub strict_cache: bool,
    /// Monopole field beyond the tabulated region instead of zeros.
    pub monopole_fallback: bool,
    /// Suppress odd azimuthal orders.
    pub even_m: bool,
    pub multistep: usize,
    pub smoothing: SmootherParameters,
}

/// Index arithmetic for the cylindrical coefficient block: cosine slots
/// for `m ∈ [0, mmax]`, then sine slots for `m ≥ 1`, `norder` terms each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CylLayout {
    mmax: usize,
    norder: usize,
}

impl CylLayout {
    pub fn new(mmax: usize, norder: usize) -> Self {
        Self { mmax, norder }
    }

    pub fn mmax(&self) -> usize {
        self.mmax
    }

    pub fn norder(&self) -> usize {
        self.norder
    }

    pub fn num_terms(&self) -> usize {
        (2 * self.mmax + 1) * self.norder
    }

    pub fn cos_base(&self, m: usize) -> usize {
        m * self.norder
    }

    pub fn sin_base(&self, m: usize) -> usize {
        debug_assert!(m >= 1);
        (self.mmax + 1 + m - 1) * self.norder
    }
}

/// Fields of the cylindrical expansion at a point, in cylindrical
/// components. `fr`, `fz`, `fp` are force components (minus gradient);
/// `fp` is −∂Φ/∂φ, still to be divided by R for the azimuthal
/// acceleration. `pot0`/`dens0` are the axisymmetric parts.
#[derive(Clone, Copy, Debug, Default)]
pub struct CylField {
    pub pot0: f64,
    pub pot: f64,
    pub fr: f64,
    pub fz: f64,
    pub fp: f64,
    pub dens0: f64,
    pub dens: f64,
}

/// Empirical cylindrical basis: built from (or loaded into) 2-D tables,
/// then accumulated and evaluated entirely through them.
pub struct CylindricalBasis {
    params: CylindricalParameters,
    grid: CylGrid,
    layout: CylLayout,
    tables: EofTables,
    cylmass: f64,
    levels: LevelBuffers,
    coefs: Vec<f64>,
    queue: DifferentialQueue,
    covariance: Option<CovarianceAccumulator>,
    used: u64,
    out_of_bounds: DiagnosticCounter,
    bad_positions: DiagnosticCounter,
    hazards: DiagnosticCounter,
    clamped_weights: DiagnosticCounter,
}

impl CylindricalBasis {
    /// Build the basis, preferring a parameter-matched cache. Collective:
    /// every rank must call this together.
    pub fn create(
        params: CylindricalParameters,
        time: f64,
        comm_f: &mut Communicator<f64>,
        comm_ctl: &mut Communicator<i64>,
    ) -> Result<Self, Error> {
        validate(&params)?;
        let grid = CylGrid::new(
            params.numx,
            params.numy,
            params.rmin,
            params.rmax,
            params.ascale,
            params.hscale,
            params.cmap,
        );
        let radial = RadialBasis::new(RadialParameters {
            lmax: params.lmax,
            nmax: params.nmax,
            numr: params.numr,
            rmin: params.rmin * params.ascale,
            rmax: params.rmax * params.ascale,
            cmap: params.cmap,
            scale: params.ascale,
            interp: Interpolation::Linear,
        })?;

        let header = CacheHeader {
            mmax: params.mmax,
            numx: params.numx,
            numy: params.numy,
            nmax: params.nmax,
            norder: params.norder,
            dens: params.dens,
            cmap: params.cmap.to_flag(),
            rmin: params.rmin,
            rmax: params.rmax,
            ascl: params.ascale,
            hscl: params.hscale,
            model: params.model.id().to_owned(),
        };

        // The master probes the cache; everyone learns the outcome
        // through a broadcast flag: 1 = cached tables follow, 0 = build,
        // -1 = strict mismatch, abort everywhere.
        let mut probe: Option<(EofTables, f64, f64)> = None;
        let mut flag = [0i64];
        let mut mismatch: Option<CacheError> = None;
        if comm_f.is_main() {
            if let Some(path) = &params.cache_file {
                if path.exists() {
                    match cache::read_cache(path, &header, params.strict_cache) {
                        Ok(Some(found)) => {
                            flag[0] = 1;
                            probe = Some(found);
                        }
                        Ok(None) => flag[0] = 0,
                        Err(err) => {
                            flag[0] = -1;
                            mismatch = Some(err);
                        }
                    }
                }
            }
        }
        comm_ctl.broadcast_from(0, &mut flag);

        let (tables, cylmass) = match flag[0] {
            1 => {
                let (mut tables, mut cylmass, _time) = probe.unwrap_or_else(|| {
                    let points = grid.points();
                    (
                        EofTables::zeros(params.mmax, params.norder, points, params.dens),
                        0.0,
                        0.0,
                    )
                });
                broadcast_loaded(&mut tables, &mut cylmass, comm_f);
                info!("cylindrical basis restored from cache");
                (tables, cylmass)
            }
            0 => {
                let (tables, cylmass) =
                    eof::build_eof(&params, &grid, &radial, comm_f, comm_ctl);
                if comm_f.is_main() {
                    if let Some(path) = &params.cache_file {
                        cache::write_cache(path, &header, cylmass, time, &tables)?;
                    }
                }
                (tables, cylmass)
            }
            _ => {
                return Err(match mismatch {
                    Some(err) => err.into(),
                    None => CacheError::Mismatch(
                        "cache rejected on another rank".into(),
                    )
                    .into(),
                });
            }
        };

        let layout = CylLayout::new(params.mmax, params.norder);
        let levels = LevelBuffers::new(params.multistep, layout.num_terms());
        let covariance = if params.smoothing.tk_type != TkType::None {
            Some(CovarianceAccumulator::new(
                params.mmax + 1,
                params.norder,
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
            out_of_bounds: DiagnosticCounter::new("cylindrical evaluation beyond grid", 1024),
            bad_positions: DiagnosticCounter::new("cylindrical non-finite position", 64),
            hazards: DiagnosticCounter::new("cylindrical covariance hazard", 64),
            clamped_weights: DiagnosticCounter::new("cylindrical smoothing weight clamp", 64),
            params,
            grid,
            layout,
            tables,
            cylmass,
            levels,
        })
    }

    pub fn layout(&self) -> &CylLayout {
        &self.layout
    }

    pub fn tables(&self) -> &EofTables {
        &self.tables
    }

    pub fn cylmass(&self) -> f64 {
        self.cylmass
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefs
    }

    pub fn out_of_bounds_count(&self) -> u64 {
        self.out_of_bounds.total()
    }

    pub fn smoothing_enabled(&self) -> bool {
        self.covariance.is_some()
    }

    pub fn smoothing_interval(&self) -> usize {
        self.params.smoothing.npca.max(1)
    }

    /// Snapshot of the fused coefficients in the external dump layout.
    pub fn coef_dump(&self, time: f64) -> crate::io::CoefDump {
        let layout = self.layout;
        let cos = (0..=layout.mmax)
            .map(|m| {
                let base = layout.cos_base(m);
                self.coefs[base..base + layout.norder].to_vec()
            })
            .collect();
        let sin = (1..=layout.mmax)
            .map(|m| {
                let base = layout.sin_base(m);
                self.coefs[base..base + layout.norder].to_vec()
            })
            .collect();
        crate::io::CoefDump {
            time,
            mmax: layout.mmax as i32,
            nmax: layout.norder as i32,
            cos,
            sin,
        }
    }

    pub fn setup_accumulation(&mut self, mlevel: usize) {
        self.levels.reset_from(mlevel);
        self.used = 0;
        if let Some(cov) = self.covariance.as_mut() {
            cov.reset();
        }
    }

    pub fn tick(&mut self, s: u64) {
        self.levels.tick(s);
    }

    /// Per-particle coefficient contribution, written into `out`.
    /// Returns false when the body lies outside the tabulated region.
    fn contribution(&self, body: &BodyView, out: &mut [f64]) -> bool {
        let (x, y, z) = (body.pos[0], body.pos[1], body.pos[2]);
        let big_r = (x * x + y * y).sqrt();
        let rr = (big_r * big_r + z * z).sqrt();
        if self.grid.out_of_bounds(rr) {
            return false;
        }
        let phi = y.atan2(x);
        let cell = self.grid.cell(big_r, z);
        let mut cosm = vec![0.0; self.layout.mmax + 1];
        let mut sinm = vec![0.0; self.layout.mmax + 1];
        sine_cosine(self.layout.mmax, phi, &mut cosm, &mut sinm);

        out.iter_mut().for_each(|v| *v = 0.0);
        for m in 0..=self.layout.mmax {
            if self.params.even_m && m % 2 == 1 {
                continue;
            }
            let cos_base = self.layout.cos_base(m);
            for k in 0..self.layout.norder {
                let value = cell.interpolate(&self.tables.cos[m][k].pot);
                out[cos_base + k] = -body.mass * cosm[m] * value;
            }
            if m > 0 {
                let sin_base = self.layout.sin_base(m);
                for k in 0..self.layout.norder {
                    let value = cell.interpolate(&self.tables.sin[m - 1][k].pot);
                    out[sin_base + k] = -body.mass * sinm[m] * value;
                }
            }
        }
        true
    }

    pub fn accumulate(&mut self, bodies: &[BodyView], mlevel: usize, nthreads: usize) {
        let nthreads = nthreads.max(1);
        let chunk = bodies.len().div_ceil(nthreads).max(1);
        let layout = self.layout;
        let with_moments = self.covariance.is_some();
        let samp_t = self.covariance.as_ref().map(|c| c.samp_t()).unwrap_or(1);
        let subsamp = self
            .covariance
            .as_ref()
            .map(|c| c.subsamp())
            .unwrap_or(false);
        let this = &*self;

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
                                    layout.mmax + 1,
                                    layout.norder,
                                    samp_t,
                                    subsamp,
                                )
                            }),
                        };
                        let mut contrib = vec![0.0; layout.num_terms()];
                        for body in slice {
                            if !body.has_finite_position() {
                                partial.bad += 1;
                                continue;
                            }
                            if !this.contribution(body, &mut contrib) {
                                partial.skipped += 1;
                                continue;
                            }
                            partial.used += 1;
                            for (c, v) in partial.coefs.iter_mut().zip(&contrib) {
                                *c += v;
                            }
                            if let Some(cov) = partial.moments.as_mut() {
                                let ensemble = cov.ensemble(body.index);
                                cov.add_particle(ensemble, body.mass);
                                for m in 0..=layout.mmax {
                                    let base = layout.cos_base(m);
                                    cov.add_contribution(
                                        m,
                                        ensemble,
                                        &contrib[base..base + layout.norder],
                                        body.mass,
                                    );
                                }
                            }
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
                self.out_of_bounds.record(|| "body outside tabulated region".into());
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

    pub fn reduce(
        &mut self,
        mlevel: usize,
        comm_f: &mut Communicator<f64>,
        comm_u: &mut Communicator<u64>,
    ) {
        self.levels.reduce_from(mlevel, comm_f);
        self.used = comm_u.collective_sum(&self.used);
        if let Some(cov) = self.covariance.as_mut() {
            cov.reduce(comm_f, comm_u);
        }
    }

    pub fn compute_multistep_coefficients(&mut self, s: u64, m_lev: usize) {
        let mut fused = std::mem::take(&mut self.coefs);
        self.levels.fused(s, m_lev, &mut fused);
        self.coefs = fused;
    }

    /// Smooth the fused coefficients, one subspace per azimuthal order;
    /// cosine and sine parts share the decomposition.
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
        for m in 0..=layout.mmax {
            let Some((mean, covar)) = cov.moments(m) else {
                continue;
            };
            if m == 0 {
                let base = layout.cos_base(0);
                let (_, tail) = self.coefs.split_at_mut(base);
                let (cos, _) = tail.split_at_mut(layout.norder);
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
                let cos_base = layout.cos_base(m);
                let sin_base = layout.sin_base(m);
                let (head, tail) = self.coefs.split_at_mut(sin_base);
                let cos = &mut head[cos_base..cos_base + layout.norder];
                let (sin, _) = tail.split_at_mut(layout.norder);
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

    pub fn multistep_update(&mut self, from: usize, to: usize, body: &BodyView) {
        if !body.has_finite_position() {
            self.bad_positions
                .record(|| "level update with non-finite position".into());
            return;
        }
        let mut delta = vec![0.0; self.layout.num_terms()];
        if self.contribution(body, &mut delta) {
            self.queue.push(from, to, delta);
        }
    }

    pub fn multistep_update_finish(&mut self, comm: &mut Communicator<f64>) {
        let mut queue = std::mem::take(&mut self.queue);
        self.levels.apply_queued(&mut queue, comm);
    }

    /// Freeze the level buffers at the end of a run.
    pub fn finalize(&mut self) {
        self.levels.finalize();
    }

    /// Zero all coefficients of order `k ≥ cut` in every buffer.
    pub fn restrict_order(&mut self, cut: usize) {
        let layout = self.layout;
        let zero_tail = move |block: &mut [f64]| {
            for m in 0..=layout.mmax {
                for k in cut..layout.norder {
                    block[layout.cos_base(m) + k] = 0.0;
                    if m > 0 {
                        block[layout.sin_base(m) + k] = 0.0;
                    }
                }
            }
        };
        self.levels.for_each_block(zero_tail);
        zero_tail(&mut self.coefs);
    }

    /// Evaluate the expansion at a cylindrical coordinate point.
    pub fn evaluate(&mut self, big_r: f64, z: f64, phi: f64) -> Result<CylField, Error> {
        if big_r < 0.0 {
            return Err(Error::InvalidCoordinate(format!(
                "negative cylindrical radius {big_r}"
            )));
        }
        let rr = (big_r * big_r + z * z).sqrt();
        if self.grid.out_of_bounds(rr) {
            self.out_of_bounds
                .record(|| format!("evaluation at rr = {rr}"));
            if self.params.monopole_fallback && rr > 0.0 {
                let pot = -self.cylmass / rr;
                return Ok(CylField {
                    pot0: pot,
                    pot,
                    fr: -self.cylmass * big_r / (rr * rr * rr),
                    fz: -self.cylmass * z / (rr * rr * rr),
                    fp: 0.0,
                    dens0: 0.0,
                    dens: 0.0,
                });
            }
            return Ok(CylField::default());
        }

        let cell = self.grid.cell(big_r, z);
        let mut cosm = vec![0.0; self.layout.mmax + 1];
        let mut sinm = vec![0.0; self.layout.mmax + 1];
        sine_cosine(self.layout.mmax, phi, &mut cosm, &mut sinm);

        let with_dens = self.params.dens;
        let mut out = CylField::default();
        for m in 0..=self.layout.mmax {
            let cos_base = self.layout.cos_base(m);
            for k in 0..self.layout.norder {
                let a = self.coefs[cos_base + k];
                let tab = &self.tables.cos[m][k];
                let fac = a * cosm[m];
                out.pot += fac * cell.interpolate(&tab.pot);
                out.fr += fac * cell.interpolate(&tab.rforce);
                out.fz += fac * cell.interpolate(&tab.zforce);
                // −∂Φ/∂φ picks up +m sin from the cosine part.
                out.fp += a * sinm[m] * m as f64 * cell.interpolate(&tab.pot);
                if with_dens {
                    out.dens += fac * cell.interpolate(&tab.dens);
                }
            }
            if m > 0 {
                let sin_base = self.layout.sin_base(m);
                for k in 0..self.layout.norder {
                    let a = self.coefs[sin_base + k];
                    let tab = &self.tables.sin[m - 1][k];
                    let fac = a * sinm[m];
                    out.pot += fac * cell.interpolate(&tab.pot);
                    out.fr += fac * cell.interpolate(&tab.rforce);
                    out.fz += fac * cell.interpolate(&tab.zforce);
                    out.fp += -a * cosm[m] * m as f64 * cell.interpolate(&tab.pot);
                    if with_dens {
                        out.dens += fac * cell.interpolate(&tab.dens);
                    }
                }
            }
            if m == 0 {
                out.pot0 = out.pot;
                out.dens0 = out.dens;
            }
        }
        Ok(out)
    }
}

fn validate(params: &CylindricalParameters) -> Result<(), InvalidBasisParameters> {
    if params.norder < 1 {
        return Err(InvalidBasisParameters(format!(
            "norder must be at least 1, got {}",
            params.norder
        )));
    }
    if params.mmax > params.lmax {
        return Err(InvalidBasisParameters(format!(
            "mmax ({}) cannot exceed lmax ({})",
            params.mmax, params.lmax
        )));
    }
    if params.norder > params.nmax * (params.lmax + 1) {
        return Err(InvalidBasisParameters(format!(
            "norder ({}) exceeds the rank of the underlying basis",
            params.norder
        )));
    }
    if params.numx < 8 || params.numy < 4 {
        return Err(InvalidBasisParameters(format!(
            "table grid {}x{} is too small",
            params.numx, params.numy
        )));
    }
    if params.ascale <= 0.0 || params.hscale <= 0.0 {
        return Err(InvalidBasisParameters(
            "scale lengths must be positive".into(),
        ));
    }
    Ok(())
}

fn broadcast_loaded(tables: &mut EofTables, cylmass: &mut f64, comm: &mut Communicator<f64>) {
    let mut mass = [*cylmass];
    comm.broadcast_from(0, &mut mass);
    *cylmass = mass[0];
    for block in tables.cos.iter_mut().chain(tables.sin.iter_mut()) {
        for function in block.iter_mut() {
            for field in function.as_blocks_mut() {
                comm.broadcast_from(0, field);
            }
        }
    }
}
