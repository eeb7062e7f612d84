//! Operations issued by the application. Outside of an explicit group each
//! call runs in an implicit one of its own.

use std::sync::Arc;

use super::launch::IntraClique;
use super::GroupState;
use crate::comm::redop::ReduceOp;
use crate::comm::{CommHandle, CommInitFn, CommSlot, Communicator, InitArgs, UniqueId};
use crate::device::{DeviceIdx, DevicePtr};
use crate::error::GroupError;
use crate::proxy::task::{CollTask, TaskDataType, TaskFuncType};

impl Communicator {
    /// Queues a collective task for the next launch.
    pub fn enqueue_coll(&mut self, mut task: CollTask, op: Option<ReduceOp>) -> Result<(), GroupError> {
        self.check_fatal()?;
        if task.root >= self.num_ranks {
            return Err(GroupError::invalid_argument(format!(
                "root {} out of range for {} ranks",
                task.root, self.num_ranks
            )));
        }
        if task.count > 0 && (task.send_buf.is_none() || task.recv_buf.is_none()) {
            return Err(GroupError::invalid_argument("null collective buffer"));
        }
        if let Some(op) = op {
            task.reduce_op = Some(self.resolve_red_op(op, task.data_type)?);
        }
        self.async_op_count += 1;
        self.async_total_size += task.total_bytes(self.num_ranks);
        self.task_queue.coll_queue.push_back(task);
        Ok(())
    }
}

impl GroupState {
    fn implicit<F>(&mut self, comm: &CommHandle, f: F) -> Result<(), GroupError>
    where
        F: FnOnce(&mut Communicator) -> Result<(), GroupError>,
    {
        self.enter();
        if self.enqueue_collective(comm).is_ok() {
            let res = f(&mut *comm.lock());
            if let Err(e) = self.record(res) {
                log::warn!("enqueue failed: {}", e);
            }
        }
        self.close()
    }

    pub fn send(
        &mut self,
        comm: &CommHandle,
        peer: usize,
        buf: Option<DevicePtr>,
        num_bytes: usize,
    ) -> Result<(), GroupError> {
        self.implicit(comm, |comm| comm.enqueue_send(peer, buf, num_bytes))
    }

    pub fn recv(
        &mut self,
        comm: &CommHandle,
        peer: usize,
        buf: Option<DevicePtr>,
        num_bytes: usize,
    ) -> Result<(), GroupError> {
        self.implicit(comm, |comm| comm.enqueue_recv(peer, buf, num_bytes))
    }

    pub fn enqueue_coll_task(
        &mut self,
        comm: &CommHandle,
        task: CollTask,
        op: Option<ReduceOp>,
    ) -> Result<(), GroupError> {
        self.implicit(comm, |comm| comm.enqueue_coll(task, op))
    }

    pub fn all_reduce(
        &mut self,
        comm: &CommHandle,
        send_buf: Option<DevicePtr>,
        recv_buf: Option<DevicePtr>,
        count: usize,
        data_type: TaskDataType,
        op: ReduceOp,
    ) -> Result<(), GroupError> {
        let task = CollTask {
            func: TaskFuncType::AllReduce,
            send_buf,
            recv_buf,
            count,
            root: 0,
            data_type,
            reduce_op: None,
        };
        self.enqueue_coll_task(comm, task, Some(op))
    }

    /// Creates one communicator rank, published into `slot` once the
    /// group closes successfully.
    pub fn init_rank(&mut self, ctor: CommInitFn, args: InitArgs, slot: &CommSlot) -> Result<(), GroupError> {
        self.enter();
        let res = self.enqueue_init(ctor, args, slot.clone());
        let _ = self.record(res);
        self.close()
    }

    /// Creates a communicator per device in this process. The ranks form
    /// one clique and launch their kernels together.
    pub fn init_all(
        &mut self,
        ctor: CommInitFn,
        devices: &[DeviceIdx],
        unique_id: UniqueId,
        slots: &[CommSlot],
    ) -> Result<(), GroupError> {
        if devices.is_empty() || devices.len() != slots.len() {
            return Err(GroupError::invalid_argument(format!(
                "{} devices for {} communicator slots",
                devices.len(),
                slots.len()
            )));
        }
        let clique = Arc::new(IntraClique::new(devices.len()));
        self.enter();
        for (rank, (&cuda_dev, slot)) in devices.iter().zip(slots.iter()).enumerate() {
            let args = InitArgs {
                unique_id,
                num_ranks: devices.len(),
                rank,
                cuda_dev,
                clique: Some(Arc::clone(&clique)),
            };
            if self.enqueue_init(ctor.clone(), args, slot.clone()).is_err() {
                break;
            }
        }
        self.close()
    }
}
