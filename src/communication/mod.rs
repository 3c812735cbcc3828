mod collective_communicator;
mod data_by_rank;
mod exchange_communicator;
mod sized_communicator;
mod world_communicator;

pub use collective_communicator::BroadcastCommunicator;
pub use collective_communicator::CollectiveCommunicator;
pub use collective_communicator::SumCommunicator;
pub use data_by_rank::DataByRank;
pub use exchange_communicator::ExchangeCommunicator;
pub use sized_communicator::SizedCommunicator;
pub use world_communicator::WorldCommunicator;

#[cfg(feature = "local")]
mod local;

#[cfg(feature = "local")]
pub use local::build_local_communicators;
#[cfg(feature = "local")]
pub type Communicator<T> = local::LocalCommunicator<T>;

#[cfg(feature = "mpi")]
mod mpi_world;

#[cfg(feature = "mpi")]
pub use mpi_world::MpiWorld;
#[cfg(feature = "mpi")]
pub use mpi_world::MPI_UNIVERSE;
#[cfg(feature = "mpi")]
pub type Communicator<T> = mpi_world::MpiWorld<T>;

#[cfg(feature = "mpi")]
pub type Rank = ::mpi::Rank;
#[cfg(not(feature = "mpi"))]
pub type Rank = i32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WorldSize(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WorldRank(pub Rank);

impl WorldRank {
    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    pub fn main() -> Rank {
        0
    }
}
