use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::communication::Communicator;
use crate::communication::SumCommunicator;

/// Sample moments of the expansion coefficients, gathered during the same
/// accumulation pass that builds the coefficients themselves.
///
/// Particles are assigned to one of `samp_t` sub-ensembles by stable
/// index. Each sub-ensemble tracks its mass, its summed coefficient
/// contributions, and (when the covariance is to be formed from second
/// moments rather than across ensembles) the mass-weighted outer-product
/// matrix.
pub struct CovarianceAccumulator {
    nmax: usize,
    samp_t: usize,
    subsamp: bool,
    used: u64,
    mass_t: Vec<f64>,
    /// [subspace][ensemble] → nmax sums of coefficient contributions
    mean_t: Vec<Vec<Vec<f64>>>,
    /// [subspace][ensemble] → nmax × nmax second moments (empty when
    /// sub-sampling, which estimates the covariance across ensembles)
    second_t: Vec<Vec<DMatrix<f64>>>,
}

impl CovarianceAccumulator {
    pub fn new(num_subspaces: usize, nmax: usize, samp_t: usize, subsamp: bool) -> Self {
        let samp_t = samp_t.max(1);
        Self {
            nmax,
            samp_t,
            subsamp,
            used: 0,
            mass_t: vec![0.0; samp_t],
            mean_t: vec![vec![vec![0.0; nmax]; samp_t]; num_subspaces],
            second_t: if subsamp {
                vec![vec![]; num_subspaces]
            } else {
                vec![vec![DMatrix::zeros(nmax, nmax); samp_t]; num_subspaces]
            },
        }
    }

    pub fn subsamp(&self) -> bool {
        self.subsamp
    }

    pub fn samp_t(&self) -> usize {
        self.samp_t
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn total_mass(&self) -> f64 {
        self.mass_t.iter().sum()
    }

    /// Ensemble slot for a particle's stable index.
    pub fn ensemble(&self, particle_index: u64) -> usize {
        (particle_index % self.samp_t as u64) as usize
    }

    /// Book a particle's mass once per accumulation pass.
    pub fn add_particle(&mut self, ensemble: usize, mass: f64) {
        self.used += 1;
        self.mass_t[ensemble] += mass;
    }

    /// Add one subspace's coefficient contribution of one particle.
    pub fn add_contribution(
        &mut self,
        subspace: usize,
        ensemble: usize,
        contribution: &[f64],
        mass: f64,
    ) {
        debug_assert_eq!(contribution.len(), self.nmax);
        let mean = &mut self.mean_t[subspace][ensemble];
        for (m, c) in mean.iter_mut().zip(contribution) {
            *m += c;
        }
        if !self.subsamp {
            let second = &mut self.second_t[subspace][ensemble];
            for i in 0..self.nmax {
                // The contribution carries one factor of mass; divide one
                // out so the outer product is mass-weighted, not squared.
                let ci = contribution[i] / mass;
                for j in 0..self.nmax {
                    second[(i, j)] += ci * contribution[j];
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.mass_t.iter_mut().for_each(|m| *m = 0.0);
        for subspace in self.mean_t.iter_mut() {
            for ensemble in subspace.iter_mut() {
                ensemble.iter_mut().for_each(|v| *v = 0.0);
            }
        }
        for subspace in self.second_t.iter_mut() {
            for ensemble in subspace.iter_mut() {
                ensemble.fill(0.0);
            }
        }
    }

    /// Merge another accumulator (a worker thread's partial) into this one.
    pub fn merge(&mut self, other: &CovarianceAccumulator) {
        self.used += other.used;
        for (m, o) in self.mass_t.iter_mut().zip(&other.mass_t) {
            *m += o;
        }
        for (subspace, other_subspace) in self.mean_t.iter_mut().zip(&other.mean_t) {
            for (ensemble, other_ensemble) in subspace.iter_mut().zip(other_subspace) {
                for (v, o) in ensemble.iter_mut().zip(other_ensemble) {
                    *v += o;
                }
            }
        }
        for (subspace, other_subspace) in self.second_t.iter_mut().zip(&other.second_t) {
            for (ensemble, other_ensemble) in subspace.iter_mut().zip(other_subspace) {
                *ensemble += other_ensemble;
            }
        }
    }

    /// All-reduce every moment so each rank holds the global statistics.
    pub fn reduce(
        &mut self,
        comm_f: &mut Communicator<f64>,
        comm_u: &mut Communicator<u64>,
    ) {
        self.used = comm_u.collective_sum(&self.used);
        comm_f.collective_sum_slice(&mut self.mass_t);
        for subspace in self.mean_t.iter_mut() {
            for ensemble in subspace.iter_mut() {
                comm_f.collective_sum_slice(ensemble);
            }
        }
        for subspace in self.second_t.iter_mut() {
            for ensemble in subspace.iter_mut() {
                comm_f.collective_sum_slice(ensemble.as_mut_slice());
            }
        }
    }

    /// Mass-normalized mean and covariance of one subspace, or `None` when
    /// no mass contributed.
    pub fn moments(&self, subspace: usize) -> Option<(DVector<f64>, DMatrix<f64>)> {
        if self.mass_t.iter().all(|m| *m <= 0.0) {
            return None;
        }
        let samp_t = self.samp_t as f64;
        let mut mean = DVector::zeros(self.nmax);
        for (ensemble, mass) in self.mean_t[subspace].iter().zip(&self.mass_t) {
            if *mass > 0.0 {
                for i in 0..self.nmax {
                    mean[i] += ensemble[i] / mass / samp_t;
                }
            }
        }
        let mut covar = DMatrix::zeros(self.nmax, self.nmax);
        if self.subsamp {
            for (ensemble, mass) in self.mean_t[subspace].iter().zip(&self.mass_t) {
                if *mass > 0.0 {
                    for i in 0..self.nmax {
                        let di = ensemble[i] / mass - mean[i];
                        for j in 0..self.nmax {
                            let dj = ensemble[j] / mass - mean[j];
                            covar[(i, j)] += di * dj / samp_t;
                        }
                    }
                }
            }
        } else {
            for (ensemble, mass) in self.second_t[subspace].iter().zip(&self.mass_t) {
                if *mass > 0.0 {
                    for i in 0..self.nmax {
                        for j in 0..self.nmax {
                            covar[(i, j)] += ensemble[(i, j)] / mass / samp_t;
                        }
                    }
                }
            }
            for i in 0..self.nmax {
                for j in 0..self.nmax {
                    covar[(i, j)] -= mean[i] * mean[j];
                }
            }
        }
        Some((mean, covar))
    }
}

#[cfg(test)]
mod tests {
    use super::CovarianceAccumulator;
    use crate::test_utils::assert_close;

    #[test]
    fn mean_is_mass_normalized() {
        let mut accum = CovarianceAccumulator::new(1, 2, 1, false);
        accum.add_particle(0, 2.0);
        accum.add_contribution(0, 0, &[2.0, 4.0], 2.0);
        accum.add_particle(0, 2.0);
        accum.add_contribution(0, 0, &[6.0, 0.0], 2.0);
        let (mean, _) = accum.moments(0).unwrap();
        assert_close(mean[0], 2.0, 1e-12);
        assert_close(mean[1], 1.0, 1e-12);
        assert_eq!(accum.used(), 2);
    }

    #[test]
    fn zero_mass_subspace_is_skipped() {
        let accum = CovarianceAccumulator::new(1, 2, 1, false);
        assert!(accum.moments(0).is_none());
    }

    #[test]
    fn subsampled_covariance_spreads_over_ensembles() {
        let mut accum = CovarianceAccumulator::new(1, 1, 2, true);
        // Two ensembles with different normalized coefficients.
        accum.add_particle(0, 1.0);
        accum.add_contribution(0, 0, &[1.0], 1.0);
        accum.add_particle(1, 1.0);
        accum.add_contribution(0, 1, &[3.0], 1.0);
        let (mean, covar) = accum.moments(0).unwrap();
        assert_close(mean[0], 2.0, 1e-12);
        // Var over {1, 3} with 1/sampT weights: ((1-2)² + (3-2)²)/2 = 1.
        assert_close(covar[(0, 0)], 1.0, 1e-12);
    }

    #[test]
    fn merge_matches_single_accumulation() {
        let mut a = CovarianceAccumulator::new(1, 2, 1, false);
        let mut b = CovarianceAccumulator::new(1, 2, 1, false);
        a.add_particle(0, 1.0);
        a.add_contribution(0, 0, &[1.0, 0.5], 1.0);
        b.add_particle(0, 3.0);
        b.add_contribution(0, 0, &[0.0, 1.5], 3.0);
        a.merge(&b);

        let mut whole = CovarianceAccumulator::new(1, 2, 1, false);
        whole.add_particle(0, 1.0);
        whole.add_contribution(0, 0, &[1.0, 0.5], 1.0);
        whole.add_particle(0, 3.0);
        whole.add_contribution(0, 0, &[0.0, 1.5], 3.0);

        let (mean_a, covar_a) = a.moments(0).unwrap();
        let (mean_w, covar_w) = whole.moments(0).unwrap();
        assert_close(mean_a[0], mean_w[0], 1e-12);
        assert_close(mean_a[1], mean_w[1], 1e-12);
        assert_close(covar_a[(0, 0)], covar_w[(0, 0)], 1e-12);
        assert_close(covar_a[(1, 1)], covar_w[(1, 1)], 1e-12);
    }
}
