use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::Arc;
use std::sync::Mutex;

use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SystemCommunicator;
use mpi::traits::Communicator as MpiCommunicator;
use mpi::traits::CommunicatorCollectives;
use mpi::traits::Destination;
use mpi::traits::Equivalence;
use mpi::traits::MatchedReceiveVec;
use mpi::traits::Root;
use mpi::traits::Source;
use mpi::Tag;
use mpi::Threading;
use once_cell::sync::Lazy;

use super::BroadcastCommunicator;
use super::CollectiveCommunicator;
use super::Rank;
use super::SizedCommunicator;
use super::SumCommunicator;
use super::WorldCommunicator;

/// Wraps the universe in an Option so it can be dropped explicitly at
/// program completion, which calls MPI_FINALIZE. Anything held by a
/// process-lifetime static would otherwise never be dropped.
pub struct StaticUniverse(Arc<Mutex<Option<Universe>>>);

impl StaticUniverse {
    pub fn world(&self) -> SystemCommunicator {
        self.0.lock().unwrap().as_ref().unwrap().world()
    }

    pub fn barrier(&self) {
        self.world().barrier();
    }

    pub fn drop(&self) {
        let _ = self.0.lock().unwrap().take();
    }
}

pub static MPI_UNIVERSE: Lazy<StaticUniverse> = Lazy::new(|| {
    let threading = Threading::Funneled;
    let (universe, threading_initialized) = mpi::initialize_with_threading(threading).unwrap();
    assert_eq!(
        threading, threading_initialized,
        "Could not initialize MPI with funneled threading"
    );
    StaticUniverse(Arc::new(Mutex::new(Some(universe))))
});

fn tag_for_type<T: 'static>() -> Tag {
    let id = TypeId::of::<T>();
    let mut s = DefaultHasher::new();
    id.hash(&mut s);
    // Truncate to the positive i16 range; MPI tags must be non-negative
    // and collisions only matter between concurrently in-flight types.
    (s.finish() as i16).abs() as Tag
}

pub struct MpiWorld<T> {
    world: SystemCommunicator,
    tag: Tag,
    _marker: PhantomData<T>,
}

impl<T: 'static> MpiWorld<T> {
    pub fn new() -> Self {
        Self {
            world: MPI_UNIVERSE.world(),
            tag: tag_for_type::<T>(),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> Default for MpiWorld<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SizedCommunicator for MpiWorld<T> {
    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }
}

impl<T: Equivalence> WorldCommunicator<T> for MpiWorld<T> {
    fn receive_vec(&mut self, rank: Rank) -> Vec<T> {
        let process = self.world.process_at_rank(rank);
        let result = process.matched_probe_with_tag(self.tag);
        let (data, _) = result.matched_receive_vec();
        data
    }

    fn send_vec(&mut self, rank: Rank, data: Vec<T>) {
        let process = self.world.process_at_rank(rank);
        process.send_with_tag(&data[..], self.tag);
    }
}

impl<T: Equivalence + Clone + Default> CollectiveCommunicator<T> for MpiWorld<T> {
    fn all_gather(&mut self, send: &T) -> Vec<T> {
        let mut result = vec![T::default(); self.size()];
        self.world.all_gather_into(send, &mut result[..]);
        result
    }
}

impl<T: Equivalence + Copy + Default + AddAssign> SumCommunicator<T> for MpiWorld<T> {
    fn collective_sum(&mut self, send: &T) -> T {
        let mut result = T::default();
        self.world
            .all_reduce_into(send, &mut result, SystemOperation::sum());
        result
    }

    fn collective_sum_slice(&mut self, data: &mut [T]) {
        let send = data.to_vec();
        self.world
            .all_reduce_into(&send[..], data, SystemOperation::sum());
    }
}

impl<T: Equivalence + Copy> BroadcastCommunicator<T> for MpiWorld<T> {
    fn broadcast_from(&mut self, root: Rank, data: &mut [T]) {
        let root_process = self.world.process_at_rank(root);
        root_process.broadcast_into(data);
    }
}
