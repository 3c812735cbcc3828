use std::marker::PhantomData;
use std::mem;
use std::ops::AddAssign;
use std::ptr;
use std::slice;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;

use super::BroadcastCommunicator;
use super::CollectiveCommunicator;
use super::DataByRank;
use super::Rank;
use super::SizedCommunicator;
use super::SumCommunicator;
use super::WorldCommunicator;

pub(super) struct Payload {
    bytes: Vec<u8>,
}

/// Channel-backed stand-in for an MPI world: every "rank" is a thread of
/// the current process. Collectives follow the same call sequence as the
/// MPI implementation, so code written against the traits runs unchanged.
pub struct LocalCommunicator<T> {
    senders: DataByRank<Sender<Payload>>,
    receivers: DataByRank<Receiver<Payload>>,
    rank: Rank,
    size: usize,
    _marker: PhantomData<T>,
}

/// Build one communicator per simulated rank, fully connected.
pub fn build_local_communicators<T>(size: usize) -> Vec<LocalCommunicator<T>> {
    let mut senders_for: Vec<DataByRank<Sender<Payload>>> =
        (0..size).map(|_| DataByRank::empty()).collect();
    let mut receivers_for: Vec<DataByRank<Receiver<Payload>>> =
        (0..size).map(|_| DataByRank::empty()).collect();
    for from in 0..size {
        for to in 0..size {
            if from == to {
                continue;
            }
            let (sender, receiver) = std::sync::mpsc::channel();
            senders_for[from].insert(to as Rank, sender);
            receivers_for[to].insert(from as Rank, receiver);
        }
    }
    receivers_for
        .into_iter()
        .zip(senders_for)
        .enumerate()
        .map(|(rank, (receivers, senders))| LocalCommunicator {
            senders,
            receivers,
            rank: rank as Rank,
            size,
            _marker: PhantomData,
        })
        .collect()
}

impl<T: Sync + Send> WorldCommunicator<T> for LocalCommunicator<T> {
    fn receive_vec(&mut self, rank: Rank) -> Vec<T> {
        let bytes = &self.receivers[rank].recv().unwrap().bytes;
        let size = mem::size_of::<T>();
        debug_assert_eq!(bytes.len().rem_euclid(size), 0);
        bytes
            .chunks_exact(size)
            .map(|chunk| unsafe { ptr::read(chunk.as_ptr().cast()) })
            .collect()
    }

    fn send_vec(&mut self, rank: Rank, data: Vec<T>) {
        let bytes = unsafe {
            slice::from_raw_parts(
                (data.as_slice() as *const [T]) as *const u8,
                data.len() * mem::size_of::<T>(),
            )
        };
        let payload = Payload {
            bytes: bytes.to_vec(),
        };
        self.senders[rank].send(payload).unwrap();
    }
}

impl<T> SizedCommunicator for LocalCommunicator<T> {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl<T: Clone + Sync + Send> CollectiveCommunicator<T> for LocalCommunicator<T> {
    fn all_gather(&mut self, data: &T) -> Vec<T> {
        for rank in self.other_ranks() {
            self.send_vec(rank, vec![data.clone()]);
        }
        let mut result = vec![];
        for rank in self.all_ranks() {
            if rank == self.rank {
                result.push(data.clone());
            } else {
                let received = self.receive_vec(rank);
                debug_assert_eq!(received.len(), 1);
                result.extend(received);
            }
        }
        result
    }
}

impl<T: Copy + Sync + Send + AddAssign> SumCommunicator<T> for LocalCommunicator<T> {
    fn collective_sum(&mut self, send: &T) -> T {
        let mut buffer = [*send];
        self.collective_sum_slice(&mut buffer);
        buffer[0]
    }

    fn collective_sum_slice(&mut self, data: &mut [T]) {
        for rank in self.other_ranks() {
            self.send_vec(rank, data.to_vec());
        }
        // Accumulate in ascending rank order so every rank computes the
        // sum in the same order and gets bit-identical results.
        let mut contributions: DataByRank<Vec<T>> = DataByRank::empty();
        for rank in self.other_ranks() {
            let received = self.receive_vec(rank);
            assert_eq!(received.len(), data.len());
            contributions.insert(rank, received);
        }
        let own = data.to_vec();
        for (i, value) in data.iter_mut().enumerate() {
            let mut first = true;
            for rank in self.all_ranks() {
                let term = if rank == self.rank {
                    own[i]
                } else {
                    contributions[rank][i]
                };
                if first {
                    *value = term;
                    first = false;
                } else {
                    *value += term;
                }
            }
        }
    }
}

impl<T: Copy + Sync + Send> BroadcastCommunicator<T> for LocalCommunicator<T> {
    fn broadcast_from(&mut self, root: Rank, data: &mut [T]) {
        if self.rank == root {
            for rank in self.other_ranks() {
                self.send_vec(rank, data.to_vec());
            }
        } else {
            let received = self.receive_vec(root);
            assert_eq!(received.len(), data.len());
            data.copy_from_slice(&received);
        }
    }
}
