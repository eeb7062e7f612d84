pub mod channel;

use crate::comm::Communicator;
use crate::error::GroupError;

pub const NUM_PROTOCOLS: usize = 1;
pub const PROTOCOL_SIMPLE: usize = 0;

/// Slots per connection buffer; P2P chunking works in units of one slot.
pub const NUM_BUFFER_SLOTS: usize = 8;

// 4MB
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 22;

pub const NUM_CONN_INDICES: usize = 2;

/// Which connection of a peer pair a transfer travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnIndex {
    Default = 0,
    /// Network-offload connection used by large P2P transfers.
    P2pNet = 1,
}

impl ConnIndex {
    pub const ALL: [ConnIndex; NUM_CONN_INDICES] = [ConnIndex::Default, ConnIndex::P2pNet];

    #[inline]
    pub fn as_usize(self) -> usize {
        self as usize
    }
}

/// Establishes peer connections requested by queued P2P work.
pub trait TransportSetup: Send + Sync {
    /// Connects every pending request of `comm` on `conn_index`.
    /// Runs on a pre-connect worker thread with the device already selected.
    fn setup_p2p(&self, comm: &Communicator, conn_index: ConnIndex) -> Result<(), GroupError>;
}
