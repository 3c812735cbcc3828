use crate::communication::Communicator;
use crate::cylindrical::CylindricalBasis;
use crate::error::Error;
use crate::spherical::BodyView;
use crate::spherical::SphericalBasis;

/// Force evaluated at a particle: cartesian acceleration, potential and
/// local density.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForceAtPoint {
    pub acc: [f64; 3],
    pub pot: f64,
    pub dens: f64,
}

/// A component's force method. Both variants share the capability set
/// {accumulate, reduce, fuse, smooth, evaluate, multistep update}; the
/// driver never needs to know which geometry it is stepping.
pub enum Force {
    Spherical(SphericalBasis),
    Cylindrical(Box<CylindricalBasis>),
}

impl Force {
    pub fn setup_accumulation(&mut self, mlevel: usize) {
        match self {
            Force::Spherical(b) => b.setup_accumulation(mlevel),
            Force::Cylindrical(b) => b.setup_accumulation(mlevel),
        }
    }

    pub fn tick(&mut self, s: u64) {
        match self {
            Force::Spherical(b) => b.tick(s),
            Force::Cylindrical(b) => b.tick(s),
        }
    }

    pub fn accumulate(&mut self, bodies: &[BodyView], mlevel: usize, nthreads: usize) {
        match self {
            Force::Spherical(b) => b.accumulate(bodies, mlevel, nthreads),
            Force::Cylindrical(b) => b.accumulate(bodies, mlevel, nthreads),
        }
    }

    pub fn reduce(
        &mut self,
        mlevel: usize,
        comm_f: &mut Communicator<f64>,
        comm_u: &mut Communicator<u64>,
    ) {
        match self {
            Force::Spherical(b) => b.reduce(mlevel, comm_f, comm_u),
            Force::Cylindrical(b) => b.reduce(mlevel, comm_f, comm_u),
        }
    }

    pub fn compute_multistep_coefficients(&mut self, s: u64, m_lev: usize) {
        match self {
            Force::Spherical(b) => b.compute_multistep_coefficients(s, m_lev),
            Force::Cylindrical(b) => b.compute_multistep_coefficients(s, m_lev),
        }
    }

    pub fn smooth(&mut self) {
        match self {
            Force::Spherical(b) => b.smooth(),
            Force::Cylindrical(b) => b.smooth(),
        }
    }

    pub fn multistep_update(&mut self, from: usize, to: usize, body: &BodyView) {
        match self {
            Force::Spherical(b) => b.multistep_update(from, to, body),
            Force::Cylindrical(b) => b.multistep_update(from, to, body),
        }
    }

    pub fn multistep_update_finish(&mut self, comm: &mut Communicator<f64>) {
        match self {
            Force::Spherical(b) => b.multistep_update_finish(comm),
            Force::Cylindrical(b) => b.multistep_update_finish(comm),
        }
    }

    pub fn restrict_order(&mut self, cut: usize) {
        match self {
            Force::Spherical(b) => b.restrict_order(cut),
            Force::Cylindrical(b) => b.restrict_order(cut),
        }
    }

    pub fn finalize(&mut self) {
        match self {
            Force::Spherical(b) => b.finalize(),
            Force::Cylindrical(b) => b.finalize(),
        }
    }

    pub fn used(&self) -> u64 {
        match self {
            Force::Spherical(b) => b.used(),
            Force::Cylindrical(b) => b.used(),
        }
    }

    /// True when smoothing is on and due at this outer step.
    pub fn smoothing_due(&self, step: u64) -> bool {
        let (enabled, interval) = match self {
            Force::Spherical(b) => (b.smoothing_enabled(), b.smoothing_interval()),
            Force::Cylindrical(b) => (b.smoothing_enabled(), b.smoothing_interval()),
        };
        enabled && step % interval as u64 == 0
    }

    /// Acceleration, potential and density at a position relative to the
    /// expansion origin.
    pub fn at_point(&mut self, pos: [f64; 3]) -> Result<ForceAtPoint, Error> {
        match self {
            Force::Spherical(basis) => {
                let (x, y, z) = (pos[0], pos[1], pos[2]);
                let r = (x * x + y * y + z * z).sqrt().max(1.0e-12);
                let theta = (z / r).clamp(-1.0, 1.0).acos();
                let phi = y.atan2(x);
                let field = basis.evaluate(r, theta, phi)?;

                let (st, ct) = (theta.sin(), theta.cos());
                let (sp, cp) = (phi.sin(), phi.cos());
                let a_r = -field.dpot_dr;
                let a_t = -field.dpot_dtheta / r;
                let a_p = if st.abs() > 1.0e-12 {
                    -field.dpot_dphi / (r * st)
                } else {
                    0.0
                };
                Ok(ForceAtPoint {
                    acc: [
                        a_r * st * cp + a_t * ct * cp - a_p * sp,
                        a_r * st * sp + a_t * ct * sp + a_p * cp,
                        a_r * ct - a_t * st,
                    ],
                    pot: field.pot,
                    dens: field.dens,
                })
            }
            Force::Cylindrical(basis) => {
                let (x, y, z) = (pos[0], pos[1], pos[2]);
                let big_r = (x * x + y * y).sqrt();
                let phi = y.atan2(x);
                let field = basis.evaluate(big_r, z, phi)?;
                let (sp, cp) = (phi.sin(), phi.cos());
                let a_p = if big_r > 1.0e-12 {
                    field.fp / big_r
                } else {
                    0.0
                };
                Ok(ForceAtPoint {
                    acc: [
                        field.fr * cp - a_p * sp,
                        field.fr * sp + a_p * cp,
                        field.fz,
                    ],
                    pot: field.pot,
                    dens: field.dens,
                })
            }
        }
    }
}
