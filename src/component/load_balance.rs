use log::debug;
use log::info;

use super::Component;
use crate::communication::Communicator;
use crate::communication::DataByRank;
use crate::communication::ExchangeCommunicator;
use crate::communication::SizedCommunicator;
use crate::communication::WorldCommunicator;
use crate::particle::BodyRecord;
use crate::particle::Particle;

/// Cumulative per-rank targets for a population of `total` bodies under
/// the given rate vector (uniform when empty). The first rank always
/// receives at least one body; the last absorbs the rounding remainder.
pub fn distribution_targets(total: u64, rates: &[f64], num_ranks: usize) -> (Vec<u64>, Vec<u64>) {
    let uniform = 1.0 / num_ranks as f64;
    let rate = |n: usize| {
        if rates.len() == num_ranks {
            rates[n]
        } else {
            uniform
        }
    };
    let mut index = vec![0u64; num_ranks];
    let mut table = vec![0u64; num_ranks];
    for n in 0..num_ranks {
        if n == 0 {
            index[0] = ((rate(0) * total as f64) as u64).clamp(1.min(total), total);
            table[0] = index[0];
        } else if n < num_ranks - 1 {
            index[n] = index[n - 1] + (rate(n) * total as f64) as u64;
            table[n] = index[n] - index[n - 1];
        } else {
            index[n] = total;
            table[n] = index[n] - index[n - 1];
        }
    }
    (index, table)
}

#[derive(Clone, Copy, Debug)]
struct Boundary {
    top: u64,
    is_new: bool,
    rank: usize,
}

impl Component {
    /// Initial assignment of the index sequence to ranks.
    pub fn setup_distribution(&mut self, rates: &[f64], num_ranks: usize) {
        let (index, table) = distribution_targets(self.nbodies_total, rates, num_ranks);
        self.nbodies_index = index;
        self.nbodies_table = table;
    }

    /// Rebalance the population to match the rate vector.
    ///
    /// Two sorted boundary sequences (current and desired cumulative
    /// upper bounds) are walked together; every interval on which the
    /// current and desired owners differ becomes one shipment. The
    /// sending rank peels particles from the high end of its key-sorted
    /// map when shipping to a higher rank, from the low end otherwise,
    /// which preserves global index order. The walk is deterministic on
    /// every rank, so shipments pair up without negotiation; bodies move
    /// in one all-to-all exchange, attributes in paired sends.
    pub fn load_balance(
        &mut self,
        rates: &[f64],
        comm_body: &mut ExchangeCommunicator<Communicator<BodyRecord>, BodyRecord>,
        comm_f: &mut Communicator<f64>,
        comm_i: &mut Communicator<i64>,
    ) {
        let num_ranks = comm_body.size();
        let my_rank = comm_body.rank() as usize;
        let (new_index, new_table) =
            distribution_targets(self.nbodies_total, rates, num_ranks);

        let mut boundaries = vec![];
        for rank in 0..num_ranks {
            boundaries.push(Boundary {
                top: self.nbodies_index[rank],
                is_new: false,
                rank,
            });
            boundaries.push(Boundary {
                top: new_index[rank],
                is_new: true,
                rank,
            });
        }
        boundaries.sort_by_key(|b| (b.top, b.is_new, b.rank));

        let mut ships = vec![];
        let mut current_owner = 0usize;
        let mut desired_owner = 0usize;
        for window in 0..(2 * num_ranks).saturating_sub(2) {
            let here = boundaries[window];
            if here.is_new {
                desired_owner = here.rank + 1;
            } else {
                current_owner = here.rank + 1;
            }
            let count = boundaries[window + 1].top - here.top;
            if count == 0 || current_owner == desired_owner {
                continue;
            }
            debug!(
                "component {}: shipping {} bodies from rank {} to rank {}",
                self.name, count, current_owner, desired_owner
            );
            ships.push((current_owner, desired_owner, count));
        }

        // Pack outgoing shipments in walk order, peeling as we go.
        let mut outgoing: DataByRank<Vec<BodyRecord>> =
            DataByRank::from_communicator(comm_body);
        let mut attrs_out: DataByRank<(Vec<i64>, Vec<f64>)> =
            DataByRank::from_communicator(comm_body);
        for (from, to, count) in ships.iter().copied() {
            if my_rank != from {
                continue;
            }
            let selected: Vec<u64> = if to > from {
                self.particles.keys().rev().take(count as usize).copied().collect()
            } else {
                self.particles.keys().take(count as usize).copied().collect()
            };
            assert_eq!(
                selected.len() as u64,
                count,
                "component {}: rank {} cannot supply {} bodies",
                self.name,
                from,
                count
            );
            for index in selected {
                let p = self.particles.remove(&index).unwrap();
                outgoing[to as i32].push(BodyRecord::pack(&p));
                let (iattrs, dattrs) = &mut attrs_out[to as i32];
                iattrs.extend(p.iattr.iter().map(|a| *a as i64));
                dattrs.extend(&p.dattr);
            }
        }

        let incoming = comm_body.exchange_all(outgoing);
        for (from, to, count) in ships.iter().copied() {
            if my_rank == from {
                let (iattrs, dattrs) =
                    std::mem::take(attrs_out.get_mut(&(to as i32)).unwrap());
                comm_i.send_vec(to as i32, iattrs);
                comm_f.send_vec(to as i32, dattrs);
            } else if my_rank == to {
                let records = &incoming[from as i32];
                let iattrs = comm_i.receive_vec(from as i32);
                let dattrs = comm_f.receive_vec(from as i32);
                assert_eq!(records.len() as u64, count);
                let niattr = iattrs.len() / records.len().max(1);
                let ndattr = dattrs.len() / records.len().max(1);
                for (n, record) in records.iter().enumerate() {
                    let iattr = iattrs[n * niattr..(n + 1) * niattr]
                        .iter()
                        .map(|a| *a as i32)
                        .collect();
                    let dattr = dattrs[n * ndattr..(n + 1) * ndattr].to_vec();
                    let p = record.unpack(iattr, dattr);
                    let replaced = self.particles.insert(p.index, p);
                    assert!(
                        replaced.is_none(),
                        "component {}: duplicate particle index after shipping",
                        self.name
                    );
                }
            }
        }

        self.nbodies_index = new_index;
        self.nbodies_table = new_table;
        self.reset_level_lists();
        self.sequence_check(my_rank);
        if my_rank == 0 {
            info!(
                "component {}: rebalanced to counts {:?}",
                self.name, self.nbodies_table
            );
        }
    }

    /// Verify the post-rebalance population: the local count matches the
    /// target and, with sequential indexing, the indices form the
    /// expected contiguous run. Violations are fatal.
    fn sequence_check(&self, my_rank: usize) {
        let expected = self.nbodies_table[my_rank];
        assert_eq!(
            self.particles.len() as u64,
            expected,
            "component {}: rank {} holds {} bodies, expected {}",
            self.name,
            my_rank,
            self.particles.len(),
            expected
        );
        if self.params.indexing {
            let seq_begin = if my_rank == 0 {
                1
            } else {
                self.nbodies_index[my_rank - 1] + 1
            };
            for (offset, index) in self.particles.keys().enumerate() {
                assert_eq!(
                    *index,
                    seq_begin + offset as u64,
                    "component {}: sequence error after rebalance",
                    self.name
                );
            }
        }
    }
}

/// Split a loaded population into this rank's slice by position in the
/// sequence.
pub fn slice_for_rank(
    particles: Vec<Particle>,
    nbodies_index: &[u64],
    rank: usize,
) -> Vec<Particle> {
    let begin = if rank == 0 {
        0
    } else {
        nbodies_index[rank - 1] as usize
    };
    let end = nbodies_index[rank] as usize;
    particles
        .into_iter()
        .skip(begin)
        .take(end - begin)
        .collect()
}
