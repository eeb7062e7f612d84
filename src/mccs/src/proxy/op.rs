use crate::comm::CommunicatorId;
use crate::transport::channel::{ChannelId, ConnType};
use crate::transport::ConnIndex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProxyOpState {
    #[default]
    Init,
    InProgress,
    Completed,
}

/// Work item for the network progress agent: one side of a P2P chunk
/// travelling through a proxied connection.
#[derive(Clone, Debug)]
pub struct ProxyOp {
    pub comm: CommunicatorId,
    pub channel: ChannelId,
    pub peer: usize,
    pub conn_type: ConnType,
    pub conn_index: ConnIndex,
    pub num_bytes: usize,
    pub num_steps: u32,
    pub chunk_steps: u32,
    pub slice_steps: u32,
    pub op_count: u64,
    pub state: ProxyOpState,
}

impl Default for ProxyOp {
    fn default() -> Self {
        ProxyOp {
            comm: CommunicatorId(0),
            channel: ChannelId(0),
            peer: 0,
            conn_type: ConnType::Send,
            conn_index: ConnIndex::Default,
            num_bytes: 0,
            num_steps: 0,
            chunk_steps: 0,
            slice_steps: 0,
            op_count: 0,
            state: ProxyOpState::Init,
        }
    }
}
