mod map;
mod solve;

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;

pub use map::CoordMap;
use nalgebra::DMatrix;

use crate::error::InvalidBasisParameters;
use self::solve::solve_radial_eigenproblem;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    Cubic,
}

#[derive(Clone, Debug)]
pub struct RadialParameters {
    pub lmax: usize,
    pub nmax: usize,
    pub numr: usize,
    pub rmin: f64,
    pub rmax: f64,
    pub cmap: CoordMap,
    pub scale: f64,
    pub interp: Interpolation,
}

#[derive(Clone, Copy, Debug)]
pub enum Field {
    Potential,
    Force,
    Density,
}

/// Tabulated Sturm–Liouville eigenbasis of the radial problem, one set of
/// `nmax` functions per harmonic order `l ≤ lmax`.
///
/// Tables are stored on a uniform grid in the mapped coordinate ξ. The
/// density member of each pair is `λ w(r) u(r) / 4π`, so the pair
/// satisfies Poisson's equation with the conditioning weight `w` and the
/// tabulated Gram matrix of the pairing is `diag(λ)`.
pub struct RadialBasis {
    params: RadialParameters,
    xi_min: f64,
    xi_max: f64,
    dxi: f64,
    /// (l, n, i) → ((l * nmax + n) * (numr + 1) + i)
    pot: Vec<f64>,
    dpot: Vec<f64>,
    dens: Vec<f64>,
    /// λ_{l,n}, the normalization constants of the biorthogonal pairing.
    norm: Vec<f64>,
}

/// Conditioning weight for the eigenproblem: a Plummer profile with the
/// basis scale length. Any positive weight yields a valid biorthogonal
/// family; this one concentrates resolution where a centrally-peaked
/// population has most of its mass.
fn conditioning_weight(r: f64, scale: f64) -> f64 {
    let u = r / scale;
    (1.0 + u * u).powf(-2.5)
}

impl RadialBasis {
    pub fn new(params: RadialParameters) -> Result<Self, InvalidBasisParameters> {
        if params.nmax < 1 {
            return Err(InvalidBasisParameters(format!(
                "nmax must be at least 1, got {}",
                params.nmax
            )));
        }
        if params.rmin >= params.rmax {
            return Err(InvalidBasisParameters(format!(
                "rmin ({}) must be below rmax ({})",
                params.rmin, params.rmax
            )));
        }
        if params.numr < 16 {
            return Err(InvalidBasisParameters(format!(
                "numr must be at least 16, got {}",
                params.numr
            )));
        }
        if params.rmin <= 0.0 {
            return Err(InvalidBasisParameters(format!(
                "rmin must be positive, got {}",
                params.rmin
            )));
        }
        if params.nmax > params.numr / 2 {
            return Err(InvalidBasisParameters(format!(
                "nmax ({}) is not resolvable on a grid of {} points",
                params.nmax, params.numr
            )));
        }

        let xi_min = params.cmap.r_to_xi(params.rmin, params.scale);
        let xi_max = params.cmap.r_to_xi(params.rmax, params.scale);
        let dxi = (xi_max - xi_min) / params.numr as f64;
        let npts = params.numr + 1;
        let nfun = (params.lmax + 1) * params.nmax;

        let mut basis = Self {
            pot: vec![0.0; nfun * npts],
            dpot: vec![0.0; nfun * npts],
            dens: vec![0.0; nfun * npts],
            norm: vec![0.0; nfun],
            xi_min,
            xi_max,
            dxi,
            params,
        };

        let scale = basis.params.scale;
        for l in 0..=basis.params.lmax {
            let eigenfunctions = solve_radial_eigenproblem(
                l,
                basis.params.nmax,
                xi_min,
                dxi,
                basis.params.numr,
                basis.params.cmap,
                scale,
                |r| conditioning_weight(r, scale),
            );
            for (n, ef) in eigenfunctions.into_iter().enumerate() {
                basis.store_eigenfunction(l, n, &ef.values, ef.lambda);
            }
        }
        Ok(basis)
    }

    fn store_eigenfunction(&mut self, l: usize, n: usize, u: &[f64], lambda: f64) {
        let npts = self.params.numr + 1;
        let base = (l * self.params.nmax + n) * npts;
        self.norm[l * self.params.nmax + n] = lambda;
        let four_pi = 4.0 * std::f64::consts::PI;
        for i in 0..npts {
            let xi = self.xi_min + self.dxi * i as f64;
            let r = self.params.cmap.xi_to_r(xi, self.params.scale);
            let jac = self.params.cmap.jacobian(xi, self.params.scale);
            self.pot[base + i] = u[i];
            // du/dr by central differences on the mapped grid
            let du_dxi = if i == 0 {
                (u[1] - u[0]) / self.dxi
            } else if i == npts - 1 {
                (u[npts - 1] - u[npts - 2]) / self.dxi
            } else {
                (u[i + 1] - u[i - 1]) / (2.0 * self.dxi)
            };
            self.dpot[base + i] = du_dxi / jac;
            self.dens[base + i] =
                lambda * conditioning_weight(r, self.params.scale) * u[i] / four_pi;
        }
    }

    pub fn lmax(&self) -> usize {
        self.params.lmax
    }

    pub fn nmax(&self) -> usize {
        self.params.nmax
    }

    pub fn rmax(&self) -> f64 {
        self.params.rmax
    }

    pub fn rmin(&self) -> f64 {
        self.params.rmin
    }

    pub fn norm(&self, l: usize, n: usize) -> f64 {
        self.norm[l * self.params.nmax + n]
    }

    /// Interpolation stencil for a radius, clamped to the table domain.
    fn stencil(&self, r: f64) -> (usize, f64) {
        let xi = self.params.cmap.r_to_xi(r, self.params.scale);
        let x = ((xi - self.xi_min) / self.dxi).clamp(0.0, self.params.numr as f64);
        let cell = (x as usize).min(self.params.numr - 1);
        (cell, x - cell as f64)
    }

    fn table(&self, field: Field) -> &[f64] {
        match field {
            Field::Potential => &self.pot,
            Field::Force => &self.dpot,
            Field::Density => &self.dens,
        }
    }

    /// Single basis-function value at radius `r`.
    pub fn value(&self, l: usize, n: usize, r: f64, field: Field) -> f64 {
        let npts = self.params.numr + 1;
        let base = (l * self.params.nmax + n) * npts;
        let table = self.table(field);
        let (cell, frac) = self.stencil(r);
        match self.params.interp {
            Interpolation::Linear => {
                table[base + cell] * (1.0 - frac) + table[base + cell + 1] * frac
            }
            Interpolation::Cubic => {
                let (start, t) = if cell == 0 {
                    (0, frac)
                } else if cell >= self.params.numr - 1 {
                    (self.params.numr - 3, frac + (cell - (self.params.numr - 3)) as f64)
                } else {
                    (cell - 1, frac + 1.0)
                };
                cubic_lagrange(
                    &table[base + start..base + start + 4],
                    t,
                )
            }
        }
    }

    /// All `(l, n)` values at one radius, written into `out[(l, n)]`.
    pub fn fill(&self, r: f64, field: Field, out: &mut DMatrix<f64>) {
        debug_assert_eq!(out.nrows(), self.params.lmax + 1);
        debug_assert_eq!(out.ncols(), self.params.nmax);
        for l in 0..=self.params.lmax {
            for n in 0..self.params.nmax {
                out[(l, n)] = self.value(l, n, r, field);
            }
        }
    }

    /// Discrete inner product ∫ u_{l,n} u_{l,m} w r² dr over the table
    /// grid, the metric under which the basis is orthonormal.
    pub fn inner_product(&self, l: usize, n: usize, m: usize) -> f64 {
        let npts = self.params.numr + 1;
        let base_n = (l * self.params.nmax + n) * npts;
        let base_m = (l * self.params.nmax + m) * npts;
        let mut total = 0.0;
        for i in 0..npts {
            let xi = self.xi_min + self.dxi * i as f64;
            let r = self.params.cmap.xi_to_r(xi, self.params.scale);
            let jac = self.params.cmap.jacobian(xi, self.params.scale);
            let cell = if i == 0 || i == npts - 1 { 0.5 } else { 1.0 };
            total += self.pot[base_n + i]
                * self.pot[base_m + i]
                * conditioning_weight(r, self.params.scale)
                * r
                * r
                * jac
                * cell
                * self.dxi;
        }
        total
    }

    /// ASCII profile of the first few basis functions per `l`, for visual
    /// inspection of a freshly built table.
    pub fn dump_table(&self, path: &Path) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        let nprint = self.params.nmax.min(3);
        writeln!(out, "# r  then (pot dens force) for n < {nprint}, per l block")?;
        for l in 0..=self.params.lmax {
            writeln!(out, "# l = {l}")?;
            for i in 0..=self.params.numr {
                let xi = self.xi_min + self.dxi * i as f64;
                let r = self.params.cmap.xi_to_r(xi, self.params.scale);
                write!(out, "{:14.6e}", r)?;
                for n in 0..nprint {
                    write!(
                        out,
                        " {:14.6e} {:14.6e} {:14.6e}",
                        self.value(l, n, r, Field::Potential),
                        self.value(l, n, r, Field::Density),
                        self.value(l, n, r, Field::Force),
                    )?;
                }
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

fn cubic_lagrange(y: &[f64], t: f64) -> f64 {
    // Four-point Lagrange interpolation with nodes at t = 0, 1, 2, 3.
    let l0 = (t - 1.0) * (t - 2.0) * (t - 3.0) / -6.0;
    let l1 = t * (t - 2.0) * (t - 3.0) / 2.0;
    let l2 = t * (t - 1.0) * (t - 3.0) / -2.0;
    let l3 = t * (t - 1.0) * (t - 2.0) / 6.0;
    y[0] * l0 + y[1] * l1 + y[2] * l2 + y[3] * l3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_basis() -> RadialBasis {
        RadialBasis::new(RadialParameters {
            lmax: 2,
            nmax: 6,
            numr: 128,
            rmin: 0.01,
            rmax: 2.0,
            cmap: CoordMap::Rational,
            scale: 0.5,
            interp: Interpolation::Linear,
        })
        .unwrap()
    }

    #[test]
    fn rejects_invalid_parameters() {
        let valid = RadialParameters {
            lmax: 2,
            nmax: 6,
            numr: 128,
            rmin: 0.01,
            rmax: 2.0,
            cmap: CoordMap::Rational,
            scale: 0.5,
            interp: Interpolation::Linear,
        };
        assert!(RadialBasis::new(RadialParameters { nmax: 0, ..valid.clone() }).is_err());
        assert!(RadialBasis::new(RadialParameters { numr: 8, ..valid.clone() }).is_err());
        assert!(RadialBasis::new(RadialParameters {
            rmin: 2.0,
            rmax: 1.0,
            ..valid.clone()
        })
        .is_err());
        assert!(RadialBasis::new(valid).is_ok());
    }

    #[test]
    fn eigenfunctions_are_orthonormal_on_the_grid() {
        let basis = small_basis();
        for l in 0..=basis.lmax() {
            for n in 0..basis.nmax() {
                for m in 0..basis.nmax() {
                    let expected = if n == m { 1.0 } else { 0.0 };
                    let actual = basis.inner_product(l, n, m);
                    assert!(
                        (actual - expected).abs() < 1e-8,
                        "l={l} n={n} m={m}: <u,u> = {actual}"
                    );
                }
            }
        }
    }

    #[test]
    fn normalization_constants_are_positive_and_increasing() {
        let basis = small_basis();
        for l in 0..=basis.lmax() {
            for n in 0..basis.nmax() {
                assert!(basis.norm(l, n) > 0.0);
                if n > 0 {
                    assert!(basis.norm(l, n) >= basis.norm(l, n - 1));
                }
            }
        }
    }

    #[test]
    fn interpolation_reproduces_grid_points() {
        let basis = small_basis();
        let xi = basis.xi_min + basis.dxi * 40.0;
        let r = basis.params.cmap.xi_to_r(xi, basis.params.scale);
        let npts = basis.params.numr + 1;
        let direct = basis.pot[(1 * basis.params.nmax + 2) * npts + 40];
        let interpolated = basis.value(1, 2, r, Field::Potential);
        assert!((direct - interpolated).abs() < 1e-10);
    }

    #[test]
    fn table_dump_is_readable() {
        let basis = small_basis();
        let mut path = std::env::temp_dir();
        path.push(format!("bfexp-radial-dump-{}", std::process::id()));
        basis.dump_table(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# l = 2"));
        // One data row per grid point and l block, plus headers.
        let rows = text.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(rows, 3 * (basis.params.numr + 1));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn density_pairs_with_potential_through_norm() {
        // ∫ u_n ρ_m dV = λ_m δ_nm / with the 4π of the volume element.
        let basis = small_basis();
        let npts = basis.params.numr + 1;
        let l = 1;
        for n in 0..basis.nmax() {
            for m in 0..basis.nmax() {
                let base_n = (l * basis.params.nmax + n) * npts;
                let base_m = (l * basis.params.nmax + m) * npts;
                let mut total = 0.0;
                for i in 0..npts {
                    let xi = basis.xi_min + basis.dxi * i as f64;
                    let r = basis.params.cmap.xi_to_r(xi, basis.params.scale);
                    let jac = basis.params.cmap.jacobian(xi, basis.params.scale);
                    let cell = if i == 0 || i == npts - 1 { 0.5 } else { 1.0 };
                    total += basis.pot[base_n + i]
                        * basis.dens[base_m + i]
                        * r
                        * r
                        * jac
                        * cell
                        * basis.dxi
                        * 4.0
                        * std::f64::consts::PI;
                }
                let expected = if n == m { basis.norm(l, m) } else { 0.0 };
                let scale = basis.norm(l, m).abs().max(1.0);
                assert!(
                    (total - expected).abs() < 1e-6 * scale,
                    "l={l} n={n} m={m}: pairing = {total}, expected {expected}"
                );
            }
        }
    }
}
