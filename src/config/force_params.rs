use serde::Deserialize;
use serde::Serialize;

use crate::cylindrical::CylindricalParameters;
use crate::cylindrical::DiskModel;
use crate::pca::SmootherParameters;
use crate::pca::TkType;
use crate::radial::CoordMap;
use crate::radial::Interpolation;
use crate::radial::RadialParameters;
use crate::spherical::SphericalParameters;

/// Keys accepted under `force.parameters:`.
pub(super) const FORCE_KEYS: &[&str] = &[
    "Lmax", "nmax", "mmax", "norder", "numr", "numx", "numy", "rmin", "rmax",
    "scale", "acyl", "hcyl", "cmap", "logr", "dens", "evenl", "evenm",
    "pca", "hallfreq", "hallfile", "eof_file", "expcond", "monopole",
    "tk_type", "hexp", "snr", "tksmooth", "tkcum", "subsamp", "samplesz", "npca",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForceId {
    SphereSL,
    Cylinder,
}

impl ForceId {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sphereSL" => Some(ForceId::SphereSL),
            "cylinder" => Some(ForceId::Cylinder),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ForceId::SphereSL => "sphereSL",
            ForceId::Cylinder => "cylinder",
        }
    }
}

/// The union of both geometries' basis parameters as they appear in the
/// configuration file, with the defaults the file format promises.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct ForceParams {
    #[serde(default = "default_lmax")]
    pub Lmax: usize,
    #[serde(default = "default_nmax")]
    pub nmax: usize,
    #[serde(default = "default_mmax")]
    pub mmax: usize,
    #[serde(default = "default_norder")]
    pub norder: usize,
    #[serde(default = "default_numr")]
    pub numr: usize,
    #[serde(default = "default_numx")]
    pub numx: usize,
    #[serde(default = "default_numy")]
    pub numy: usize,
    #[serde(default = "default_rmin")]
    pub rmin: f64,
    #[serde(default = "default_rmax")]
    pub rmax: f64,
    #[serde(default = "default_one")]
    pub scale: f64,
    #[serde(default = "default_one")]
    pub acyl: f64,
    #[serde(default = "default_tenth")]
    pub hcyl: f64,
    #[serde(default = "default_cmap")]
    pub cmap: i32,
    #[serde(default)]
    pub logr: bool,
    #[serde(default)]
    pub dens: bool,
    #[serde(default)]
    pub evenl: bool,
    #[serde(default)]
    pub evenm: bool,
    #[serde(default)]
    pub pca: bool,
    #[serde(default = "default_hallfreq")]
    pub hallfreq: usize,
    #[serde(default)]
    pub hallfile: Option<String>,
    #[serde(default)]
    pub eof_file: Option<String>,
    /// Conditioning target for the empirical basis.
    #[serde(default)]
    pub expcond: DiskModel,
    /// Monopole field beyond the cylindrical table instead of zeros.
    #[serde(default)]
    pub monopole: bool,
    #[serde(default)]
    pub tk_type: TkType,
    #[serde(default = "default_one")]
    pub hexp: f64,
    #[serde(default = "default_one")]
    pub snr: f64,
    #[serde(default = "default_tksmooth")]
    pub tksmooth: f64,
    #[serde(default = "default_tkcum")]
    pub tkcum: f64,
    #[serde(default)]
    pub subsamp: bool,
    #[serde(default = "default_samplesz")]
    pub samplesz: usize,
    #[serde(default = "default_npca")]
    pub npca: usize,
}

fn default_lmax() -> usize {
    4
}
fn default_nmax() -> usize {
    10
}
fn default_mmax() -> usize {
    4
}
fn default_norder() -> usize {
    8
}
fn default_numr() -> usize {
    200
}
fn default_numx() -> usize {
    128
}
fn default_numy() -> usize {
    64
}
fn default_rmin() -> f64 {
    1.0e-3
}
fn default_rmax() -> f64 {
    20.0
}
fn default_one() -> f64 {
    1.0
}
fn default_tenth() -> f64 {
    0.1
}
fn default_cmap() -> i32 {
    1
}
fn default_hallfreq() -> usize {
    50
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

impl Default for ForceParams {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

impl ForceParams {
    pub fn smoothing(&self) -> SmootherParameters {
        SmootherParameters {
            tk_type: if self.pca { self.tk_type } else { TkType::None },
            hexp: self.hexp,
            snr: self.snr,
            tksmooth: self.tksmooth,
            tkcum: self.tkcum,
            subsamp: self.subsamp,
            samplesz: self.samplesz,
            npca: self.npca.max(1),
        }
    }

    pub fn spherical(&self, multistep: usize) -> SphericalParameters {
        SphericalParameters {
            radial: RadialParameters {
                lmax: self.Lmax,
                nmax: self.nmax,
                numr: self.numr,
                rmin: self.rmin,
                rmax: self.rmax,
                cmap: if self.logr {
                    CoordMap::Log
                } else {
                    CoordMap::from_flag(self.cmap)
                },
                scale: self.scale,
                interp: Interpolation::Linear,
            },
            even_l: self.evenl,
            multistep,
            smoothing: self.smoothing(),
        }
    }

    pub fn cylindrical(&self, multistep: usize, strict: bool) -> CylindricalParameters {
        CylindricalParameters {
            mmax: self.mmax,
            norder: self.norder,
            numx: self.numx,
            numy: self.numy,
            lmax: self.Lmax.max(self.mmax),
            nmax: self.nmax,
            numr: self.numr,
            rmin: self.rmin,
            rmax: self.rmax,
            ascale: self.acyl,
            hscale: self.hcyl,
            cmap: if self.logr {
                CoordMap::Log
            } else {
                CoordMap::from_flag(self.cmap)
            },
            dens: self.dens,
            model: self.expcond,
            eof_numr: 64,
            eof_numt: 48,
            eof_nump: 16,
            cache_file: self.eof_file.as_ref().map(|s| s.into()),
            strict_cache: strict,
            monopole_fallback: self.monopole,
            even_m: self.evenm,
            multistep,
            smoothing: {
                let mut smoothing = self.smoothing();
                smoothing.npca = self.hallfreq.max(1);
                smoothing
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_field() {
        let params = ForceParams::default();
        assert_eq!(params.Lmax, 4);
        assert_eq!(params.nmax, 10);
        assert_eq!(params.cmap, 1);
        assert!(!params.pca);
        assert_eq!(params.tk_type, TkType::None);
    }

    #[test]
    fn smoothing_requires_pca_flag() {
        let mut params = ForceParams {
            tk_type: TkType::Hall,
            ..Default::default()
        };
        assert_eq!(params.smoothing().tk_type, TkType::None);
        params.pca = true;
        assert_eq!(params.smoothing().tk_type, TkType::Hall);
    }

    #[test]
    fn cylindrical_parameters_inherit_the_cache_path() {
        let params = ForceParams {
            eof_file: Some(".eof.cache".into()),
            ..Default::default()
        };
        let cyl = params.cylindrical(0, true);
        assert_eq!(cyl.cache_file.as_deref(), Some(std::path::Path::new(".eof.cache")));
        assert!(cyl.strict_cache);
    }
}
