mod load_balance;

pub use load_balance::distribution_targets;
pub use load_balance::slice_for_rank;

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Instant;

use log::info;

use crate::communication::Communicator;
use crate::communication::SumCommunicator;
use crate::config::ComponentParams;
use crate::diagnostics::DiagnosticCounter;
use crate::force::Force;
use crate::particle::Particle;
use crate::spherical::BodyView;

/// A named particle population bound to one force method.
///
/// The particle container is an ordered map keyed by the stable index,
/// so per-rank iteration order is deterministic and the rebalance
/// algorithm can reason about contiguous index ranges.
pub struct Component {
    pub name: String,
    pub params: ComponentParams,
    pub force: Force,
    particles: BTreeMap<u64, Particle>,
    multistep: usize,
    /// Total population across ranks.
    pub nbodies_total: u64,
    /// Cumulative upper bound of the index sequence per rank.
    pub nbodies_index: Vec<u64>,
    /// Population per rank.
    pub nbodies_table: Vec<u64>,
    /// Local particle indices per multistep level.
    levlist: Vec<Vec<u64>>,

    /// Initial centers, fixed at load time.
    pub com_i: [f64; 3],
    pub cov_i: [f64; 3],
    /// Current center of mass, velocity, acceleration.
    pub com0: [f64; 3],
    pub cov0: [f64; 3],
    pub acc0: [f64; 3],
    /// Offset supplied by the orientation estimator.
    pub center: [f64; 3],
    /// Per-level accumulators, 3·(multistep+1) entries each.
    com_lev: Vec<f64>,
    cov_lev: Vec<f64>,
    acc_lev: Vec<f64>,
    com_mas: Vec<f64>,
    pub mtot: f64,
    /// Mass participating in the center-of-mass system (escapers leave).
    pub mtot0: f64,
    escaped: u64,
    com_hazards: DiagnosticCounter,
    eval_hazards: DiagnosticCounter,
}

impl Component {
    pub fn new(
        name: String,
        params: ComponentParams,
        force: Force,
        multistep: usize,
        num_ranks: usize,
    ) -> Self {
        Self {
            name,
            params,
            force,
            particles: BTreeMap::new(),
            multistep,
            nbodies_total: 0,
            nbodies_index: vec![0; num_ranks],
            nbodies_table: vec![0; num_ranks],
            levlist: vec![vec![]; multistep + 1],
            com_i: [0.0; 3],
            cov_i: [0.0; 3],
            com0: [0.0; 3],
            cov0: [0.0; 3],
            acc0: [0.0; 3],
            center: [0.0; 3],
            com_lev: vec![0.0; 3 * (multistep + 1)],
            cov_lev: vec![0.0; 3 * (multistep + 1)],
            acc_lev: vec![0.0; 3 * (multistep + 1)],
            com_mas: vec![0.0; multistep + 1],
            mtot: 0.0,
            mtot0: 0.0,
            escaped: 0,
            com_hazards: DiagnosticCounter::new("center-of-mass accumulator hazard", 16),
            eval_hazards: DiagnosticCounter::new("force evaluation hazard", 256),
        }
    }

    pub fn num_local(&self) -> usize {
        self.particles.len()
    }

    pub fn multistep(&self) -> usize {
        self.multistep
    }

    pub fn particle(&self, index: u64) -> Option<&Particle> {
        self.particles.get(&index)
    }

    pub fn particles(&self) -> impl Iterator<Item = &Particle> {
        self.particles.values()
    }

    pub fn local_mass(&self) -> f64 {
        self.particles.values().map(|p| p.mass).sum()
    }

    pub fn levlist(&self, level: usize) -> &[u64] {
        &self.levlist[level]
    }

    pub fn escaped_count(&self) -> u64 {
        self.escaped
    }

    /// Install this rank's particle slice after loading.
    pub fn adopt_particles(&mut self, particles: Vec<Particle>) {
        for p in particles {
            let replaced = self.particles.insert(p.index, p);
            assert!(replaced.is_none(), "duplicate particle index on adoption");
        }
        self.reset_level_lists();
    }

    /// Record the load-time centers; collective over ranks.
    pub fn initialize_com_system(&mut self, comm_f: &mut Communicator<f64>) {
        let mut sums = [0.0; 7];
        for p in self.particles.values() {
            sums[0] += p.mass;
            for k in 0..3 {
                sums[1 + k] += p.mass * p.pos[k];
                sums[4 + k] += p.mass * p.vel[k];
            }
        }
        comm_f.collective_sum_slice(&mut sums);
        self.mtot = sums[0];
        self.mtot0 = sums[0];
        if sums[0] > 0.0 {
            for k in 0..3 {
                self.com_i[k] = sums[1 + k] / sums[0];
                self.cov_i[k] = sums[4 + k] / sums[0];
            }
        }
        self.com0 = self.com_i;
        self.cov0 = self.cov_i;
    }

    /// Rebuild the per-level lists from particle state. Fatal when a
    /// particle carries a level outside `[0, multistep]`.
    pub fn reset_level_lists(&mut self) {
        for list in self.levlist.iter_mut() {
            list.clear();
        }
        for p in self.particles.values() {
            assert!(
                p.level <= self.multistep,
                "particle {} carries invalid level {}",
                p.index,
                p.level
            );
            self.levlist[p.level].push(p.index);
        }
        let total: usize = self.levlist.iter().map(|l| l.len()).sum();
        assert_eq!(
            total,
            self.particles.len(),
            "level lists out of sync with the particle map"
        );
    }

    pub fn print_level_lists(&self, time: f64) {
        info!("component {} level occupancy at t = {:.6}:", self.name, time);
        for (level, list) in self.levlist.iter().enumerate() {
            info!("  level {:>2}: {:>10}", level, list.len());
        }
    }

    /// Origin of the force expansion in the simulation frame.
    pub fn expansion_origin(&self) -> [f64; 3] {
        let mut origin = self.center;
        if self.params.com {
            for k in 0..3 {
                origin[k] += self.com0[k];
            }
        }
        origin
    }

    fn is_escaped(&self, p: &Particle) -> bool {
        match self.params.keypos {
            Some(keypos) => p.iattr.get(keypos).copied().unwrap_or(0) != 0,
            None => false,
        }
    }

    /// Bodies of one level, in expansion-frame coordinates. Particles
    /// beyond `rtrunc` are frozen: they still feel the field but do not
    /// contribute to it.
    pub fn bodies_at_level(&self, level: usize) -> Vec<BodyView> {
        let origin = self.expansion_origin();
        self.levlist[level]
            .iter()
            .filter_map(|index| {
                let p = &self.particles[index];
                if p.radius_from(&origin) > self.params.rtrunc {
                    return None;
                }
                Some(BodyView {
                    pos: [
                        p.pos[0] - origin[0],
                        p.pos[1] - origin[1],
                        p.pos[2] - origin[2],
                    ],
                    mass: p.mass,
                    index: p.index,
                })
            })
            .collect()
    }

    /// Accumulate every level at or above `m_lev` into its buffers.
    pub fn accumulate(&mut self, m_lev: usize, nthreads: usize) {
        self.force.setup_accumulation(m_lev);
        for level in m_lev..=self.multistep {
            let bodies = self.bodies_at_level(level);
            self.force.accumulate(&bodies, level, nthreads);
        }
    }

    pub fn reduce(
        &mut self,
        m_lev: usize,
        comm_f: &mut Communicator<f64>,
        comm_u: &mut Communicator<u64>,
    ) {
        self.force.reduce(m_lev, comm_f, comm_u);
    }

    /// Evaluate the field at every particle of levels ≥ `m_lev`, writing
    /// acceleration and potential back and charging evaluation time to
    /// the per-particle effort counters.
    pub fn apply_forces(&mut self, m_lev: usize) {
        let origin = self.expansion_origin();
        for level in m_lev..=self.multistep {
            for i in 0..self.levlist[level].len() {
                let index = self.levlist[level][i];
                let p = &self.particles[&index];
                if !p.has_finite_position() {
                    self.eval_hazards
                        .record(|| format!("particle {index} has a non-finite position"));
                    continue;
                }
                let rel = [
                    p.pos[0] - origin[0],
                    p.pos[1] - origin[1],
                    p.pos[2] - origin[2],
                ];
                let start = Instant::now();
                let eval = self.force.at_point(rel);
                let micros = start.elapsed().as_micros() as u64;
                let p = self.particles.get_mut(&index).unwrap();
                match eval {
                    Ok(field) => {
                        p.acc = field.acc;
                        p.pot = field.pot;
                        p.effort += micros;
                    }
                    Err(_) => {
                        self.eval_hazards
                            .record(|| format!("field evaluation failed for particle {index}"));
                    }
                }
            }
        }
    }

    /// Kick-drift update with the level's sub-step size.
    pub fn integrate(&mut self, m_lev: usize, dtime: f64) {
        for level in m_lev..=self.multistep {
            let dt = dtime / (1u64 << level) as f64;
            for index in &self.levlist[level] {
                let p = self.particles.get_mut(index).unwrap();
                for k in 0..3 {
                    p.vel[k] += p.acc[k] * dt;
                    p.pos[k] += p.vel[k] * dt;
                }
            }
        }
    }

    /// Move a particle to a new level, queuing the coefficient
    /// differential with the force method.
    pub fn change_level(&mut self, index: u64, to: usize) {
        let origin = self.expansion_origin();
        let p = self.particles.get_mut(&index).unwrap();
        let from = p.level;
        if from == to {
            return;
        }
        let body = BodyView {
            pos: [
                p.pos[0] - origin[0],
                p.pos[1] - origin[1],
                p.pos[2] - origin[2],
            ],
            mass: p.mass,
            index,
        };
        p.level = to;
        self.force.multistep_update(from, to, &body);
        self.levlist[from].retain(|i| *i != index);
        self.levlist[to].push(index);
    }

    /// Recompute centers over levels ≥ `m_lev` and retire escapers.
    ///
    /// A particle farther than `rcom` from the initial center whose
    /// gating attribute is zero is flagged as escaped: its mass and
    /// momentum leave the center-of-mass system permanently.
    pub fn fix_positions(&mut self, m_lev: usize, comm_f: &mut Communicator<f64>) {
        for level in m_lev..=self.multistep {
            self.com_mas[level] = 0.0;
            for k in 0..3 {
                self.com_lev[3 * level + k] = 0.0;
                self.cov_lev[3 * level + k] = 0.0;
                self.acc_lev[3 * level + k] = 0.0;
            }
        }

        // Escape detection against the initial center plus orientation
        // offset.
        let mut escape_sums = [0.0; 7];
        if let Some(keypos) = self.params.keypos {
            let mut reference = self.com_i;
            for k in 0..3 {
                reference[k] += self.center[k];
            }
            let rcom = self.params.rcom;
            let mut newly_escaped = vec![];
            for (index, p) in self.particles.iter() {
                if self.is_escaped(p) {
                    continue;
                }
                if p.radius_from(&reference) > rcom {
                    newly_escaped.push(*index);
                }
            }
            for index in newly_escaped {
                let p = self.particles.get_mut(&index).unwrap();
                if p.iattr.len() > keypos {
                    p.iattr[keypos] = 1;
                }
                escape_sums[0] += p.mass;
                for k in 0..3 {
                    escape_sums[1 + k] += p.mass * p.pos[k];
                    escape_sums[4 + k] += p.mass * p.vel[k];
                }
                self.escaped += 1;
            }
        }
        comm_f.collective_sum_slice(&mut escape_sums);
        let mass_escaped = escape_sums[0];
        if mass_escaped > 0.0 && self.mtot0 - mass_escaped > 0.0 {
            let remaining = self.mtot0 - mass_escaped;
            for k in 0..3 {
                self.com_i[k] = (self.mtot0 * self.com_i[k] - escape_sums[1 + k]) / remaining;
                self.com0[k] = (self.mtot0 * self.com0[k] - escape_sums[1 + k]) / remaining;
                self.cov_i[k] = (self.mtot0 * self.cov_i[k] - escape_sums[4 + k]) / remaining;
                self.cov0[k] = (self.mtot0 * self.cov0[k] - escape_sums[4 + k]) / remaining;
            }
            self.mtot0 = remaining;
        }

        for level in m_lev..=self.multistep {
            for index in &self.levlist[level] {
                let p = &self.particles[index];
                if self.is_escaped(p) {
                    continue;
                }
                self.com_mas[level] += p.mass;
                for k in 0..3 {
                    self.com_lev[3 * level + k] += p.mass * p.pos[k];
                    self.cov_lev[3 * level + k] += p.mass * p.vel[k];
                    self.acc_lev[3 * level + k] += p.mass * p.acc[k];
                }
            }
        }

        // Sum all levels and reduce across ranks.
        let mut totals = [0.0; 10];
        for level in 0..=self.multistep {
            totals[0] += self.com_mas[level];
            for k in 0..3 {
                totals[1 + k] += self.com_lev[3 * level + k];
                totals[4 + k] += self.cov_lev[3 * level + k];
                totals[7 + k] += self.acc_lev[3 * level + k];
            }
        }
        comm_f.collective_sum_slice(&mut totals);
        self.mtot = totals[0];

        if totals.iter().any(|v| !v.is_finite()) {
            self.com_hazards
                .record(|| "non-finite center-of-mass accumulator, keeping old center".into());
            return;
        }
        if self.mtot > 0.0 {
            let mut com = [0.0; 3];
            let mut cov = [0.0; 3];
            let mut acc = [0.0; 3];
            for k in 0..3 {
                com[k] = totals[1 + k] / self.mtot;
                cov[k] = totals[4 + k] / self.mtot;
                acc[k] = totals[7 + k] / self.mtot;
            }
            if self.params.com {
                self.com0 = com;
                self.cov0 = cov;
                self.acc0 = acc;
            } else {
                self.acc0 = [0.0; 3];
            }
        }
    }

    /// Append one line of center bookkeeping; rank 0 only.
    pub fn write_com_log(&self, time: f64, path: &std::path::Path) -> std::io::Result<()> {
        if !self.params.comlog {
            return Ok(());
        }
        let mut out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(
            out,
            "{:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e} {:15.8e}",
            time,
            self.com0[0], self.com0[1], self.com0[2],
            self.cov0[0], self.cov0[1], self.cov0[2],
            self.acc0[0], self.acc0[1], self.acc0[2],
            self.center[0], self.center[1], self.center[2],
        )
    }

}

#[cfg(all(test, feature = "local"))]
mod tests;
