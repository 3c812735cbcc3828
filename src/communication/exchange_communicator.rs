use super::DataByRank;
use super::Rank;
use super::SizedCommunicator;
use super::WorldCommunicator;

/// All-to-all exchange of per-rank buffers. Every rank sends one (possibly
/// empty) message to every other rank and receives one back, so a single
/// `exchange_all` is a full synchronization point.
pub struct ExchangeCommunicator<C, T> {
    pub communicator: C,
    pending_data: DataByRank<bool>,
    _marker: std::marker::PhantomData<T>,
}

impl<C, T> ExchangeCommunicator<C, T>
where
    C: SizedCommunicator,
{
    pub fn new(communicator: C) -> Self {
        let pending_data = DataByRank::from_communicator(&communicator);
        Self {
            communicator,
            pending_data,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<C, T> ExchangeCommunicator<C, T>
where
    C: WorldCommunicator<T>,
    C: SizedCommunicator,
{
    pub fn blocking_send_vec(&mut self, rank: Rank, data: Vec<T>) {
        debug_assert!(!self.pending_data[rank]);
        self.pending_data[rank] = true;
        self.communicator.send_vec(rank, data);
    }

    fn empty_send_to_others(&mut self) {
        for rank in self.communicator.other_ranks() {
            if !self.pending_data[rank] {
                self.blocking_send_vec(rank, vec![]);
            }
        }
    }

    /// Send every per-rank buffer and collect one from every peer. The
    /// pairwise schedule is fixed and identical on all ranks, so the
    /// blocking sends and receives always pair up, whatever the message
    /// sizes.
    pub fn exchange_all(&mut self, mut data: DataByRank<Vec<T>>) -> DataByRank<Vec<T>> {
        let mut received = DataByRank::from_communicator(&self.communicator);
        let size = self.size() as Rank;
        let me = self.rank();
        for i in 0..size {
            for j in (i + 1)..size {
                if me == i {
                    let payload = data.remove(&j).unwrap_or_default();
                    self.communicator.send_vec(j, payload);
                    received.insert(j, self.communicator.receive_vec(j));
                } else if me == j {
                    received.insert(i, self.communicator.receive_vec(i));
                    let payload = data.remove(&i).unwrap_or_default();
                    self.communicator.send_vec(i, payload);
                }
            }
        }
        received
    }

    pub fn receive_vec(&mut self) -> DataByRank<Vec<T>> {
        self.empty_send_to_others();
        let mut received_data = DataByRank::from_communicator(&self.communicator);
        for rank in self.communicator.other_ranks() {
            let received = self.communicator.receive_vec(rank);
            received_data.insert(rank, received);
            self.pending_data[rank] = false;
        }
        received_data
    }
}

impl<C, T> SizedCommunicator for ExchangeCommunicator<C, T>
where
    C: SizedCommunicator,
{
    fn rank(&self) -> Rank {
        self.communicator.rank()
    }

    fn size(&self) -> usize {
        self.communicator.size()
    }
}

#[cfg(test)]
#[cfg(feature = "local")]
mod tests {
    use std::thread;

    use super::ExchangeCommunicator;
    use crate::communication::build_local_communicators;
    use crate::communication::Rank;
    use crate::communication::SizedCommunicator;

    #[test]
    fn exchange_all_is_a_full_synchronization() {
        use crate::communication::DataByRank;
        let num_ranks = 3;
        let communicators = build_local_communicators::<u64>(num_ranks);
        let threads: Vec<_> = communicators
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let mut comm = ExchangeCommunicator::new(comm);
                    let mut outgoing: DataByRank<Vec<u64>> =
                        DataByRank::from_communicator(&comm);
                    for other in comm.other_ranks() {
                        outgoing[other] = vec![rank as u64 * 10 + other as u64];
                    }
                    let incoming = comm.exchange_all(outgoing);
                    for other in comm.other_ranks() {
                        assert_eq!(
                            incoming[other],
                            vec![other as u64 * 10 + rank as u64]
                        );
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn exchange_communicator() {
        let num_ranks = 4;
        let communicators = build_local_communicators::<i32>(num_ranks);
        let threads: Vec<_> = communicators
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let n = num_ranks as i32;
                    let wrap = |x: i32| x.rem_euclid(n);
                    let mut comm = ExchangeCommunicator::new(comm);
                    comm.blocking_send_vec(wrap(rank + 1), vec![rank, wrap(rank + 1)]);
                    let received = comm.receive_vec();
                    for other in comm.other_ranks() {
                        if other == wrap(rank - 1) {
                            assert_eq!(received[other], vec![wrap(rank - 1), rank]);
                        } else {
                            assert_eq!(received[other], Vec::<i32>::new());
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
