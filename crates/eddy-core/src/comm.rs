//! Local communicator seam.
//!
//! The engine needs the transport only for the core-assignment handshake:
//! the local rank and size of the processes sharing this node, plus two
//! all-gather primitives used to exchange CPU-set bitmaps. The concrete
//! transport (MPI or otherwise) lives outside this crate and implements
//! [`LocalComm`].

/// A communicator over the processes co-located on one node.
///
/// `allgather_*` calls are collective: every local rank must call them in
/// the same order with coherent arguments, and each returns the
/// contributions of all ranks in local-rank order.
pub trait LocalComm: Send + Sync {
    /// This process's rank within the node-local communicator.
    fn local_rank(&self) -> usize;

    /// The number of processes in the node-local communicator.
    fn local_size(&self) -> usize;

    /// All-gathers one `u32` per rank, returned in local-rank order.
    fn allgather_u32(&self, value: u32) -> Vec<u32>;

    /// All-gathers a variable number of `u64` words per rank.
    ///
    /// `counts[r]` is the number of words contributed by rank `r` (as
    /// previously agreed via [`allgather_u32`](Self::allgather_u32)); the
    /// result concatenates every rank's words in local-rank order.
    fn allgather_words(&self, words: &[u64], counts: &[u32]) -> Vec<u64>;
}

/// The trivial communicator for a process running alone on its node.
///
/// Every all-gather returns just this process's own contribution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloComm;

impl LocalComm for SoloComm {
    fn local_rank(&self) -> usize {
        0
    }

    fn local_size(&self) -> usize {
        1
    }

    fn allgather_u32(&self, value: u32) -> Vec<u32> {
        vec![value]
    }

    fn allgather_words(&self, words: &[u64], _counts: &[u32]) -> Vec<u64> {
        words.to_vec()
    }
}
