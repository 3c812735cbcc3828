use super::Rank;

/// Point-to-point messaging between ranks. Sends are matched to receives
/// in program order; there are no tags beyond the per-type channel.
pub trait WorldCommunicator<T> {
    fn send_vec(&mut self, rank: Rank, data: Vec<T>);
    fn receive_vec(&mut self, rank: Rank) -> Vec<T>;
}
