//! Group execution engine.
//!
//! Calls made while a group is open only enqueue. Closing the outermost
//! group initializes pending communicators, connects peers, schedules the
//! queued P2P transfers and launches the resulting kernels. If anything
//! fails before kernels reach the device, every queued operation is rolled
//! back so the group looks as if it had never been entered.

pub mod dispatch;
pub mod enqueue;
pub mod launch;
pub mod rollback;
pub mod sched;

use std::sync::Arc;

use crate::comm::{CommHandle, CommInitFn, CommSlot, InitArgs};
use crate::config::GroupConfig;
use crate::device::DeviceRuntime;
use crate::device_warning;
use crate::error::{GroupError, StickyError};
use crate::proxy::ProxyProgress;
use crate::transport::{ConnIndex, TransportSetup};

use sched::P2pScheduler;

/// External collaborators driven by the engine.
#[derive(Clone)]
pub struct Backend {
    pub device: Arc<dyn DeviceRuntime>,
    pub transport: Arc<dyn TransportSetup>,
    pub proxy: Arc<dyn ProxyProgress>,
}

pub struct InitOp {
    pub ctor: CommInitFn,
    pub args: InitArgs,
    pub slot: CommSlot,
}

pub struct CollOp {
    pub comm: CommHandle,
    /// Connection index being set up, only during pre-connect.
    pub conn_index: Option<ConnIndex>,
}

pub enum AsyncOp {
    Init(InitOp),
    Coll(CollOp),
}

impl std::fmt::Debug for AsyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsyncOp::Init(op) => f
                .debug_struct("Init")
                .field("rank", &op.args.rank)
                .field("cuda_dev", &op.args.cuda_dev)
                .finish(),
            AsyncOp::Coll(op) => f.debug_tuple("Coll").field(&op.comm.lock().id).finish(),
        }
    }
}

/// Pending group of one calling context.
pub struct GroupState {
    backend: Backend,
    depth: usize,
    max_async_ops: usize,
    ops: Vec<AsyncOp>,
    error: StickyError,
}

impl GroupState {
    pub fn new(backend: Backend, config: &GroupConfig) -> Self {
        let max_async_ops = config.max_async_ops.max(1);
        GroupState {
            backend,
            depth: 0,
            max_async_ops,
            ops: Vec::with_capacity(max_async_ops),
            error: StickyError::default(),
        }
    }

    #[inline]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn enter(&mut self) {
        if self.depth == 0 {
            self.ops.clear();
            self.error = StickyError::default();
        }
        self.depth += 1;
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn in_group(&self) -> bool {
        self.depth > 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[AsyncOp] {
        &self.ops
    }

    /// First failure recorded in the open group.
    pub fn error(&self) -> Option<&GroupError> {
        self.error.get()
    }

    /// Records the result of an operation issued inside the group.
    pub fn record<T>(&mut self, res: Result<T, GroupError>) -> Result<T, GroupError> {
        self.error.record(res)
    }

    fn check_capacity(&mut self) -> Result<(), GroupError> {
        if !self.in_group() {
            return Err(GroupError::invalid_usage("operation enqueued outside of a group"));
        }
        if self.ops.len() >= self.max_async_ops {
            log::warn!(
                "too many async operations in progress, max is {}",
                self.max_async_ops
            );
            return self.error.record(Err(GroupError::invalid_usage(format!(
                "more than {} operations in one group",
                self.max_async_ops
            ))));
        }
        Ok(())
    }

    pub fn enqueue_init(
        &mut self,
        ctor: CommInitFn,
        args: InitArgs,
        slot: CommSlot,
    ) -> Result<(), GroupError> {
        self.check_capacity()?;
        self.ops.push(AsyncOp::Init(InitOp { ctor, args, slot }));
        Ok(())
    }

    /// Adds `comm` to the group. A communicator is recorded at most once.
    pub fn enqueue_collective(&mut self, comm: &CommHandle) -> Result<(), GroupError> {
        let recorded = self.ops.iter().any(|op| match op {
            AsyncOp::Coll(coll) => coll.comm.ptr_eq(comm),
            AsyncOp::Init(_) => false,
        });
        if recorded {
            return Ok(());
        }
        self.check_capacity()?;
        self.ops.push(AsyncOp::Coll(CollOp {
            comm: comm.clone(),
            conn_index: None,
        }));
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), GroupError> {
        if self.depth == 0 {
            log::warn!("group close called without a matching enter");
            return Err(GroupError::invalid_usage("not in a group"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }

        let saved_dev = self.error.record(
            self.backend
                .device
                .current_device()
                .map_err(GroupError::from),
        );
        self.execute();

        self.ops.clear();
        let res = std::mem::take(&mut self.error).into_result();
        match (saved_dev, res) {
            (Ok(dev), Ok(())) => self
                .backend
                .device
                .select_device(dev)
                .map_err(GroupError::from),
            (Ok(dev), Err(e)) => {
                device_warning!(self.backend.device.select_device(dev), "restore device");
                Err(e)
            }
            (Err(_), res) => res,
        }
    }

    fn collective_comms(&self) -> Vec<CommHandle> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                AsyncOp::Coll(coll) => Some(coll.comm.clone()),
                AsyncOp::Init(_) => None,
            })
            .collect()
    }

    fn execute(&mut self) {
        if self.error.is_ok() {
            dispatch::run_inits(&self.backend, &self.ops, &mut self.error);
        }
        for conn_index in ConnIndex::ALL {
            if self.error.is_ok() {
                dispatch::preconnect(&self.backend, &mut self.ops, conn_index, &mut self.error);
            }
        }
        let comms = self.collective_comms();
        if self.error.is_ok() {
            let _ = self.error.record(schedule_p2p(&comms));
        }
        if self.error.is_ok() {
            let _ = self.error.record(launch::prepare(&self.backend, &comms));
        }
        if let Some(e) = self.error.get() {
            log::warn!("group failed, rolling back {} operations: {}", self.ops.len(), e);
            rollback::rollback(&self.ops);
            return;
        }
        launch::launch(&self.backend, &comms, &mut self.error);
    }
}

fn schedule_p2p(comms: &[CommHandle]) -> Result<(), GroupError> {
    for handle in comms.iter() {
        let mut comm = handle.lock();
        if !comm.p2p.has_pending() {
            continue;
        }
        let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p)?;
        log::debug!("{}: {} P2P transfer chunks scheduled", comm.id, descs.len());
        for desc in descs.iter() {
            comm.setup_p2p_transfer(desc);
        }
    }
    Ok(())
}
