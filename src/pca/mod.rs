mod accumulator;

use log::debug;
use nalgebra::DMatrix;
use nalgebra::DVector;
use serde::Deserialize;
use serde::Serialize;

pub use accumulator::CovarianceAccumulator;

use crate::diagnostics::DiagnosticCounter;

/// Coefficient selection policy. `Hall` tapers by signal-to-noise, the
/// cut variants zero modes wholesale, `None` computes the diagnostics
/// without touching the coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TkType {
    Hall,
    VarianceCut,
    CumulativeCut,
    VarianceWeighted,
    #[default]
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmootherParameters {
    #[serde(default)]
    pub tk_type: TkType,
    #[serde(default = "default_hexp")]
    pub hexp: f64,
    #[serde(default = "default_snr")]
    pub snr: f64,
    #[serde(default = "default_tksmooth")]
    pub tksmooth: f64,
    #[serde(default = "default_tkcum")]
    pub tkcum: f64,
    #[serde(default)]
    pub subsamp: bool,
    /// Number of sub-ensembles when sub-sampling.
    #[serde(default = "default_samplesz")]
    pub samplesz: usize,
    /// Recompute the covariance decomposition every `npca` steps.
    #[serde(default = "default_npca")]
    pub npca: usize,
}

fn default_hexp() -> f64 {
    1.0
}
fn default_snr() -> f64 {
    1.0
}
fn default_tksmooth() -> f64 {
    3.0
}
fn default_tkcum() -> f64 {
    0.95
}
fn default_samplesz() -> usize {
    1
}
fn default_npca() -> usize {
    1
}

impl Default for SmootherParameters {
    fn default() -> Self {
        Self {
            tk_type: TkType::None,
            hexp: default_hexp(),
            snr: default_snr(),
            tksmooth: default_tksmooth(),
            tkcum: default_tkcum(),
            subsamp: false,
            samplesz: default_samplesz(),
            npca: default_npca(),
        }
    }
}

/// Outcome of smoothing one harmonic subspace, for the diagnostic log.
pub struct SubspaceReport {
    pub weights: Vec<f64>,
    pub eigenvalues: Vec<f64>,
}

/// Denoise the coefficient vectors of one harmonic subspace in place.
///
/// `mean` is the mass-normalized mean coefficient vector and `covar` its
/// sample covariance; `n_for_snr` is the ensemble count entering the
/// noise estimate (`samplesz` for a sub-sampled covariance, the global
/// particle count otherwise — one convention, used consistently). The
/// same per-mode weights apply to every vector in `coefs` (cosine and,
/// when present, sine parts share the decomposition).
pub fn smooth_subspace(
    params: &SmootherParameters,
    mean: &DVector<f64>,
    covar: &DMatrix<f64>,
    n_for_snr: f64,
    coefs: &mut [&mut [f64]],
    hazards: &mut DiagnosticCounter,
    clamped: &mut DiagnosticCounter,
) -> Option<SubspaceReport> {
    let nmax = mean.len();
    let eigen = covar.clone().symmetric_eigen();
    if eigen.eigenvalues.iter().any(|v| !v.is_finite()) {
        hazards.record(|| "non-finite eigenvalue in coefficient covariance".into());
        return None;
    }

    // Project the mean onto the eigenbasis: t = Vᵀ ā.
    let t = eigen.eigenvectors.transpose() * mean;

    let mut weights = vec![1.0; nmax];
    match params.tk_type {
        TkType::Hall => {
            for k in 0..nmax {
                let b = (eigen.eigenvalues[k] / (t[k] * t[k] * n_for_snr))
                    .max(f64::MIN_POSITIVE);
                weights[k] = 1.0 / (1.0 + (params.snr * b).powf(params.hexp));
            }
        }
        TkType::VarianceCut => {
            for k in 0..nmax {
                weights[k] = if params.tksmooth * eigen.eigenvalues[k] < t[k] * t[k] {
                    1.0
                } else {
                    0.0
                };
            }
        }
        TkType::CumulativeCut => {
            // Keep the leading modes of the eigenvalue spectrum, largest
            // first, up to the cumulative fraction tkcum.
            let mut order: Vec<usize> = (0..nmax).collect();
            order.sort_by(|&i, &j| {
                eigen.eigenvalues[j]
                    .partial_cmp(&eigen.eigenvalues[i])
                    .unwrap()
            });
            let total: f64 = eigen.eigenvalues.iter().sum();
            let mut cuml = 0.0;
            for (position, &k) in order.iter().enumerate() {
                cuml += eigen.eigenvalues[k];
                weights[k] = if position == 0 || cuml / total <= params.tkcum {
                    1.0
                } else {
                    0.0
                };
            }
        }
        TkType::VarianceWeighted => {
            for k in 0..nmax {
                let tt = t[k] * t[k];
                weights[k] = tt / (tt + eigen.eigenvalues[k] + 1.0e-14);
            }
        }
        TkType::None => {}
    }

    for w in weights.iter_mut() {
        if !(0.0..=1.0).contains(w) {
            clamped.record(|| format!("smoothing weight {w} outside [0, 1]"));
            *w = w.clamp(0.0, 1.0);
        }
    }

    if params.tk_type != TkType::None {
        for coef in coefs.iter_mut() {
            assert_eq!(coef.len(), nmax);
            let raw = DVector::from_column_slice(coef);
            let mut projected = eigen.eigenvectors.transpose() * raw;
            for k in 0..nmax {
                projected[k] *= weights[k];
            }
            let smoothed = &eigen.eigenvectors * projected;
            coef.copy_from_slice(smoothed.as_slice());
        }
    } else {
        debug!(
            "smoother diagnostics only: leading eigenvalue {:.3e}",
            eigen.eigenvalues.iter().cloned().fold(0.0f64, f64::max)
        );
    }

    Some(SubspaceReport {
        weights,
        eigenvalues: eigen.eigenvalues.as_slice().to_vec(),
    })
}
