use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;

use crate::comm::CommunicatorId;

pub mod op;
pub mod plan;
pub mod task;

pub use op::{ProxyOp, ProxyOpState};

/// Receives proxy ops once their kernels have been submitted.
pub trait ProxyProgress: Send + Sync {
    fn post(&self, comm: CommunicatorId, ops: Vec<ProxyOp>);
}

pub type ProxyPool = Arc<Mutex<Vec<ProxyOp>>>;

/// Communicator-side view of the network progress agent.
///
/// `next_ops` belongs to the communicator and is filled while scheduling.
/// The free pool is shared with the agent, which returns completed ops to
/// it, so it is only touched under its lock.
pub struct ProxyState {
    pool: ProxyPool,
    local_pool: Vec<ProxyOp>,
    next_ops: VecDeque<ProxyOp>,
}

impl Default for ProxyState {
    fn default() -> Self {
        ProxyState::new()
    }
}

impl ProxyState {
    pub fn new() -> Self {
        ProxyState {
            pool: Arc::new(Mutex::new(Vec::new())),
            local_pool: Vec::new(),
            next_ops: VecDeque::new(),
        }
    }

    pub fn pool_handle(&self) -> ProxyPool {
        Arc::clone(&self.pool)
    }

    fn allocate(&mut self) -> ProxyOp {
        if self.local_pool.is_empty() {
            let mut pool = self.pool.lock();
            std::mem::swap(&mut self.local_pool, &mut *pool);
        }
        self.local_pool.pop().unwrap_or_default()
    }

    pub fn save(&mut self, init: impl FnOnce(&mut ProxyOp)) {
        let mut op = self.allocate();
        op.state = ProxyOpState::Init;
        init(&mut op);
        self.next_ops.push_back(op);
    }

    #[inline]
    pub fn num_pending(&self) -> usize {
        self.next_ops.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ProxyOp> {
        self.next_ops.iter()
    }

    pub fn take_pending(&mut self) -> Vec<ProxyOp> {
        self.next_ops.drain(..).collect()
    }

    /// Returns every pending op to the free pool. Used when a group is
    /// cancelled before its kernels were submitted.
    pub fn return_pending(&mut self) -> usize {
        let num = self.next_ops.len();
        let mut pool = self.pool.lock();
        pool.extend(self.next_ops.drain(..));
        num
    }

    pub fn num_free(&self) -> usize {
        self.local_pool.len() + self.pool.lock().len()
    }
}
