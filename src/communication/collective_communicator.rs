use super::Rank;

pub trait CollectiveCommunicator<T> {
    fn all_gather(&mut self, send: &T) -> Vec<T>;
}

/// Element-wise sum reduction with the result available on every rank.
/// The operator order is fixed (by ascending rank), so the result is
/// bit-identical on all ranks and across repeated runs.
pub trait SumCommunicator<T> {
    fn collective_sum(&mut self, send: &T) -> T;

    /// Sum `data` element-wise across ranks, overwriting `data` on every
    /// rank with the reduced values. All ranks must pass equal lengths.
    fn collective_sum_slice(&mut self, data: &mut [T]);
}

pub trait BroadcastCommunicator<T> {
    /// Replace `data` on every rank with rank `root`'s copy. All ranks
    /// must pass equal lengths.
    fn broadcast_from(&mut self, root: Rank, data: &mut [T]);
}
