use crate::communication::Communicator;
use crate::communication::ExchangeCommunicator;
use crate::communication::SizedCommunicator;
use crate::communication::WorldRank;
use crate::communication::WorldSize;
use crate::particle::BodyRecord;

/// The per-rank communicator bundle. One typed channel per traffic
/// class; collectives on different members never interleave, so the
/// call sequences stay matched across ranks.
pub struct Comms {
    /// Coefficient reductions, table broadcasts, attribute shipping.
    pub world: Communicator<f64>,
    /// Particle counters.
    pub counts: Communicator<u64>,
    /// Control messages: work requests, flags, integer attributes.
    pub control: Communicator<i64>,
    /// Particle records during rebalancing and checkpoint gathers.
    pub bodies: ExchangeCommunicator<Communicator<BodyRecord>, BodyRecord>,
}

impl Comms {
    pub fn rank(&self) -> WorldRank {
        WorldRank(self.world.rank())
    }

    pub fn size(&self) -> WorldSize {
        WorldSize(self.world.size())
    }

    pub fn is_main(&self) -> bool {
        self.world.is_main()
    }
}

#[cfg(feature = "mpi")]
impl Comms {
    /// The process-wide MPI world, one typed view per traffic class.
    pub fn for_mpi() -> Self {
        use crate::communication::MpiWorld;
        Self {
            world: MpiWorld::new(),
            counts: MpiWorld::new(),
            control: MpiWorld::new(),
            bodies: ExchangeCommunicator::new(MpiWorld::new()),
        }
    }
}

#[cfg(feature = "local")]
impl Comms {
    /// Fully-connected channel worlds for `size` simulated ranks.
    pub fn local_set(size: usize) -> Vec<Comms> {
        use crate::communication::build_local_communicators;
        let world = build_local_communicators::<f64>(size);
        let counts = build_local_communicators::<u64>(size);
        let control = build_local_communicators::<i64>(size);
        let bodies = build_local_communicators::<BodyRecord>(size);
        world
            .into_iter()
            .zip(counts)
            .zip(control)
            .zip(bodies)
            .map(|(((world, counts), control), bodies)| Comms {
                world,
                counts,
                control,
                bodies: ExchangeCommunicator::new(bodies),
            })
            .collect()
    }
}
