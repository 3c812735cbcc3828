use crate::communication::Communicator;
use crate::communication::SumCommunicator;
use crate::diagnostics::DiagnosticCounter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelState {
    Uninitialized,
    Accumulating,
    Drained,
}

/// Per-level coefficient buffers for multi-timestep integration.
///
/// Each level `M` keeps two complete snapshots of its coefficient block:
/// `last` (finished at sub-step `dstep_l[M]`) and `next` (finished at the
/// level's most recent synchronization, valid until `dstep_n[M]`). A level
/// is re-accumulated every `interval[M] = 2^(multistep - M)` sub-steps; on
/// the tick that crosses `dstep_n[M]` the snapshots swap and `next` is
/// zeroed for fresh accumulation. Levels coarser than the currently active
/// one are linearly interpolated between their snapshots, which keeps the
/// fused coefficients continuous across every level boundary.
pub struct LevelBuffers {
    len: usize,
    last: Vec<Vec<f64>>,
    next: Vec<Vec<f64>>,
    dstep_l: Vec<u64>,
    dstep_n: Vec<u64>,
    interval: Vec<u64>,
    state: Vec<LevelState>,
    interpolation_errors: DiagnosticCounter,
}

impl LevelBuffers {
    /// `multistep + 1` levels of coefficient blocks of `len` doubles.
    pub fn new(multistep: usize, len: usize) -> Self {
        let nlev = multistep + 1;
        let interval: Vec<u64> = (0..nlev)
            .map(|m| 1u64 << (multistep - m))
            .collect();
        Self {
            len,
            last: vec![vec![0.0; len]; nlev],
            next: vec![vec![0.0; len]; nlev],
            dstep_l: vec![0; nlev],
            dstep_n: interval.clone(),
            interval,
            state: vec![LevelState::Uninitialized; nlev],
            interpolation_errors: DiagnosticCounter::new("multistep interpolation", 64),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.state.len()
    }

    pub fn block_len(&self) -> usize {
        self.len
    }

    pub fn interval(&self, level: usize) -> u64 {
        self.interval[level]
    }

    pub fn state(&self, level: usize) -> LevelState {
        self.state[level]
    }

    /// The accumulation target for a level's current interval.
    pub fn next_mut(&mut self, level: usize) -> &mut [f64] {
        self.state[level] = LevelState::Accumulating;
        &mut self.next[level]
    }

    pub fn next(&self, level: usize) -> &[f64] {
        &self.next[level]
    }

    pub fn last(&self, level: usize) -> &[f64] {
        &self.last[level]
    }

    /// Advance to sub-step `s`, swapping every level whose window closes
    /// here. This is the only place the L/N exchange happens.
    pub fn tick(&mut self, s: u64) {
        for level in 0..self.num_levels() {
            if s == self.dstep_n[level] {
                std::mem::swap(&mut self.last[level], &mut self.next[level]);
                self.dstep_l[level] = self.dstep_n[level];
                self.dstep_n[level] += self.interval[level];
                self.next[level].iter_mut().for_each(|v| *v = 0.0);
            }
        }
    }

    /// Zero the accumulation targets of every level at or above `mlevel`,
    /// ahead of a fresh accumulation pass.
    pub fn reset_from(&mut self, mlevel: usize) {
        for level in mlevel..self.num_levels() {
            self.next[level].iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Sum the active levels' partial blocks across ranks. Every rank ends
    /// up with identical snapshots.
    pub fn reduce_from(&mut self, mlevel: usize, comm: &mut Communicator<f64>) {
        for level in mlevel..self.num_levels() {
            comm.collective_sum_slice(&mut self.next[level]);
        }
    }

    /// Fused coefficient block for force evaluation at sub-step `s` with
    /// leading level `m_lev`: levels below `m_lev` interpolate between
    /// their snapshots, levels at or above contribute their current one.
    pub fn fused(&mut self, s: u64, m_lev: usize, out: &mut [f64]) {
        assert_eq!(out.len(), self.len);
        out.iter_mut().for_each(|v| *v = 0.0);
        for level in 0..m_lev.min(self.num_levels()) {
            if self.dstep_n[level] == self.dstep_l[level] {
                for (o, n) in out.iter_mut().zip(&self.next[level]) {
                    *o += n;
                }
                continue;
            }
            let raw = (s as f64 - self.dstep_l[level] as f64)
                / (self.dstep_n[level] as f64 - self.dstep_l[level] as f64);
            if !(0.0..=1.0).contains(&raw) {
                self.interpolation_errors.record(|| {
                    format!("level {level}: weight {raw} at sub-step {s}")
                });
            }
            let b = raw.clamp(0.0, 1.0);
            let a = 1.0 - b;
            for ((o, l), n) in out.iter_mut().zip(&self.last[level]).zip(&self.next[level]) {
                *o += a * l + b * n;
            }
        }
        for level in m_lev..self.num_levels() {
            for (o, n) in out.iter_mut().zip(&self.next[level]) {
                *o += n;
            }
        }
    }

    /// Apply a queued level-change differential: the particle's current
    /// contribution leaves `from` and enters `to`.
    pub fn apply_differential(&mut self, from: usize, to: usize, delta: &[f64]) {
        assert_eq!(delta.len(), self.len);
        for (n, d) in self.next[from].iter_mut().zip(delta) {
            *n -= d;
        }
        for (n, d) in self.next[to].iter_mut().zip(delta) {
            *n += d;
        }
    }

    /// Apply thread-queued level changes: fold the queue into per-level
    /// delta blocks, all-reduce them (every rank participates in the same
    /// collectives regardless of which levels it touched), and add the
    /// global deltas to the current snapshots.
    pub fn apply_queued(
        &mut self,
        queue: &mut DifferentialQueue,
        comm: &mut Communicator<f64>,
    ) {
        let mut deltas = vec![vec![0.0; self.len]; self.num_levels()];
        for (from, to, delta) in queue.updates.drain(..) {
            assert_eq!(delta.len(), self.len);
            for (d, v) in deltas[from].iter_mut().zip(&delta) {
                *d -= v;
            }
            for (d, v) in deltas[to].iter_mut().zip(&delta) {
                *d += v;
            }
        }
        for (level, delta) in deltas.iter_mut().enumerate() {
            comm.collective_sum_slice(delta);
            for (n, d) in self.next[level].iter_mut().zip(delta.iter()) {
                *n += d;
            }
        }
    }

    /// Visit every snapshot block of every level, e.g. to zero a range of
    /// radial orders in place.
    pub fn for_each_block(&mut self, mut f: impl FnMut(&mut [f64])) {
        for block in self.last.iter_mut().chain(self.next.iter_mut()) {
            f(block);
        }
    }

    pub fn finalize(&mut self) {
        for state in self.state.iter_mut() {
            *state = LevelState::Drained;
        }
    }
}

/// Thread-queued differential updates, applied at the end-of-substep
/// barrier and then reduced alongside the level buffers.
#[derive(Default)]
pub struct DifferentialQueue {
    pub(crate) updates: Vec<(usize, usize, Vec<f64>)>,
}

impl DifferentialQueue {
    pub fn push(&mut self, from: usize, to: usize, delta: Vec<f64>) {
        self.updates.push((from, to, delta));
    }

    pub fn drain_into(&mut self, buffers: &mut LevelBuffers) {
        for (from, to, delta) in self.updates.drain(..) {
            buffers.apply_differential(from, to, &delta);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_follow_level_powers() {
        let buffers = LevelBuffers::new(3, 4);
        assert_eq!(buffers.interval(0), 8);
        assert_eq!(buffers.interval(1), 4);
        assert_eq!(buffers.interval(2), 2);
        assert_eq!(buffers.interval(3), 1);
    }

    #[test]
    fn tick_swaps_at_window_boundaries() {
        let mut buffers = LevelBuffers::new(1, 2);
        buffers.next_mut(0).copy_from_slice(&[1.0, 2.0]);
        buffers.next_mut(1).copy_from_slice(&[0.5, 0.5]);
        // Level 1 swaps every tick, level 0 every other tick.
        buffers.tick(1);
        assert_eq!(buffers.last(1), &[0.5, 0.5]);
        assert_eq!(buffers.next(1), &[0.0, 0.0]);
        assert_eq!(buffers.next(0), &[1.0, 2.0]);
        buffers.tick(2);
        assert_eq!(buffers.last(0), &[1.0, 2.0]);
        assert_eq!(buffers.next(0), &[0.0, 0.0]);
    }

    #[test]
    fn fused_is_continuous_across_a_level_boundary() {
        // Two levels, interval ratio 2; accumulate only at level 0.
        let mut buffers = LevelBuffers::new(1, 1);
        buffers.next_mut(0)[0] = 3.0;
        buffers.tick(1);
        buffers.tick(2);
        // Window [2, 4): last = 3.0 from the first window, next refilled.
        buffers.next_mut(0)[0] = 5.0;

        let mut before = [0.0];
        let mut after = [0.0];
        // Just before the level-0 window closes at s = 4 the interpolation
        // weight reaches 1; after the swap the fresh window starts at
        // weight 0 on the same snapshot.
        buffers.fused(4, 1, &mut before);
        buffers.tick(3);
        buffers.tick(4);
        buffers.fused(4, 1, &mut after);
        assert!((before[0] - 5.0).abs() < 1e-12);
        assert!((after[0] - 5.0).abs() < 1e-12);
        assert!((before[0] - after[0]).abs() < 1e-12);
    }

    #[test]
    fn differential_update_moves_contribution_between_levels() {
        let mut buffers = LevelBuffers::new(2, 2);
        buffers.next_mut(1).copy_from_slice(&[4.0, 4.0]);
        let mut queue = DifferentialQueue::default();
        queue.push(1, 2, vec![1.5, 0.5]);
        queue.drain_into(&mut buffers);
        assert_eq!(buffers.next(1), &[2.5, 3.5]);
        assert_eq!(buffers.next(2), &[1.5, 0.5]);
        let mut fused = [0.0, 0.0];
        buffers.fused(0, 0, &mut fused);
        assert_eq!(fused, [4.0, 4.0]);
    }

    #[cfg(feature = "local")]
    #[test]
    fn reduce_sums_across_ranks() {
        use crate::communication::build_local_communicators;
        let comms = build_local_communicators::<f64>(2);
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, mut comm)| {
                std::thread::spawn(move || {
                    let mut buffers = LevelBuffers::new(0, 3);
                    buffers.next_mut(0)[rank] = 1.0 + rank as f64;
                    buffers.reduce_from(0, &mut comm);
                    assert_eq!(buffers.next(0), &[1.0, 2.0, 0.0]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
