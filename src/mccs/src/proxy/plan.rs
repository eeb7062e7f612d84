use std::cmp::Ordering;

use itertools::Itertools;

use super::task::{CollTask, TaskDataType, TaskFuncType, TaskReduceOp, TaskSchema};
use crate::comm::{Communicator, CommunicatorId};
use crate::device::{DeviceIdx, DevicePtr};
use crate::error::GroupError;
use crate::group::sched::{TransferDescriptor, TransferSide};
use crate::transport::channel::{ChannelId, ConnType};
use crate::transport::ConnIndex;

pub const MCCS_MAX_ELEMENTS_PER_WORK: usize = 10;
pub const MCCS_MAX_CHANNELS: usize = 64;
pub const P2P_THREADS_PER_BLOCK: u32 = 512;

#[derive(Clone, Debug)]
pub struct WorkElemColl {
    pub num_warps: u8,
    pub send_buf: Option<DevicePtr>,
    pub recv_buf: Option<DevicePtr>,
    pub count: usize,
    pub root: u32,
    // block id
    pub bid: u8,
    pub num_channels: u8,
    pub func: TaskFuncType,
    pub data_type: TaskDataType,
    pub reduce_op: Option<TaskReduceOp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkElemP2p {
    pub delta: usize,
    pub send: Option<TransferSide>,
    pub recv: Option<TransferSide>,
}

#[derive(Clone, Debug)]
pub enum KernelWork {
    Coll { num_warps: u8, work_elems: Vec<WorkElemColl> },
    P2p { work_elems: Vec<WorkElemP2p> },
}

impl KernelWork {
    pub fn num_elems(&self) -> usize {
        match self {
            KernelWork::Coll { work_elems, .. } => work_elems.len(),
            KernelWork::P2p { work_elems } => work_elems.len(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChanWorkSchedule {
    pub coll_bytes: usize,
    pub p2p_bytes: usize,
    pub work_queue: Vec<KernelWork>,
}

impl ChanWorkSchedule {
    fn enqueue_work_elem_coll(&mut self, elem: WorkElemColl, num_bytes: usize) {
        self.coll_bytes += num_bytes;
        if let Some(KernelWork::Coll {
            num_warps,
            work_elems,
        }) = self.work_queue.last_mut()
        {
            // accumulate same type work_elems
            if elem.num_warps == *num_warps && work_elems.len() < MCCS_MAX_ELEMENTS_PER_WORK {
                work_elems.push(elem);
                return;
            }
        }
        self.work_queue.push(KernelWork::Coll {
            num_warps: elem.num_warps,
            work_elems: vec![elem],
        });
    }

    fn enqueue_work_elem_p2p(&mut self, elem: WorkElemP2p) {
        let num_bytes = elem.send.map_or(0, |s| s.num_bytes) + elem.recv.map_or(0, |r| r.num_bytes);
        self.p2p_bytes += num_bytes;
        if let Some(KernelWork::P2p { work_elems }) = self.work_queue.last_mut() {
            if work_elems.len() < MCCS_MAX_ELEMENTS_PER_WORK {
                work_elems.push(elem);
                return;
            }
        }
        self.work_queue.push(KernelWork::P2p {
            work_elems: vec![elem],
        });
    }
}

/// Device work of one communicator for one group.
#[derive(Clone, Debug)]
pub struct KernelPlan {
    pub comm: CommunicatorId,
    pub channel_upper_bound: u32,
    pub channel_count: u32,
    pub channel_mask: u64,
    pub threads_per_block: u32,
    pub works: Vec<(ChannelId, Vec<KernelWork>)>,
    pub op_count: u64,
}

impl KernelPlan {
    pub fn num_works(&self) -> usize {
        self.works.iter().map(|(_, works)| works.len()).sum()
    }
}

/// Plan ready for submission on a device.
#[derive(Clone, Debug)]
pub struct KernelLaunch {
    pub comm: CommunicatorId,
    pub device: DeviceIdx,
    pub plan: KernelPlan,
}

impl Communicator {
    /// Places one scheduled P2P chunk on its channel and saves proxy ops
    /// for the sides that go through the network-offload connection.
    pub fn setup_p2p_transfer(&mut self, desc: &TransferDescriptor) {
        let elem = WorkElemP2p {
            delta: desc.delta,
            send: desc.send,
            recv: desc.recv,
        };
        self.launch
            .plan_schedule
            .entry(desc.channel)
            .or_default()
            .enqueue_work_elem_p2p(elem);

        let step_size = self.profile.step_size();
        let op_count = self.launch.op_count;
        for (side, conn_type) in [(desc.send, ConnType::Send), (desc.recv, ConnType::Recv)] {
            let Some(side) = side else { continue };
            if side.conn_index != ConnIndex::P2pNet || side.peer == self.rank {
                continue;
            }
            let comm = self.id;
            self.proxy.save(|op| {
                op.comm = comm;
                op.channel = desc.channel;
                op.peer = side.peer;
                op.conn_type = conn_type;
                op.conn_index = side.conn_index;
                op.num_bytes = side.num_bytes;
                op.num_steps = side.num_bytes.div_ceil(step_size).max(1) as u32;
                op.chunk_steps = 1;
                op.slice_steps = 1;
                op.op_count = op_count;
            });
        }
        self.launch.p2p_op_count += 1;
    }

    /// Spreads queued collective tasks over the least loaded channels.
    pub fn compute_coll_work(&mut self) -> Result<(), GroupError> {
        while let Some(task) = self.task_queue.coll_queue.pop_front() {
            let schema = TaskSchema::for_task(&task, self.num_ranks, self.profile.num_channels);
            self.enqueue_coll_elems(&task, &schema);
            self.launch.coll_op_count += 1;
        }
        Ok(())
    }

    fn enqueue_coll_elems(&mut self, task: &CollTask, schema: &TaskSchema) {
        let num_warps = (schema.num_threads / 32) as u8;
        let num_bytes = task.total_bytes(self.num_ranks);
        let per_channel = num_bytes.div_ceil(schema.num_channels.max(1) as usize);
        for (block_id, chan_id) in self
            .select_best_channels(schema.num_channels)
            .into_iter()
            .enumerate()
        {
            let elem = WorkElemColl {
                num_warps,
                send_buf: task.send_buf,
                recv_buf: task.recv_buf,
                count: task.count,
                root: task.root as _,
                bid: block_id as u8,
                num_channels: schema.num_channels as _,
                func: task.func,
                data_type: task.data_type,
                reduce_op: task.reduce_op.clone(),
            };
            self.launch
                .plan_schedule
                .entry(chan_id)
                .or_default()
                .enqueue_work_elem_coll(elem, per_channel);
        }
    }

    // block id -> ChannelId
    fn select_best_channels(&self, num: u32) -> Vec<ChannelId> {
        (0..self.profile.num_channels)
            .map(|chan_id| ChannelLoad {
                id: ChannelId(chan_id),
                coll_bytes: self
                    .launch
                    .plan_schedule
                    .get(&ChannelId(chan_id))
                    .map_or(0, |chan| chan.coll_bytes),
            })
            .k_smallest(num as usize)
            .map(|load| load.id)
            .collect()
    }

    /// Turns the per-channel schedules into a kernel plan queued for
    /// host setup. Does nothing when no work was scheduled.
    pub fn finalize_plan(&mut self) -> Result<Option<&KernelPlan>, GroupError> {
        self.compute_coll_work()?;
        let schedule = std::mem::take(&mut self.launch.plan_schedule);
        let mut channel_mask = 0u64;
        let mut threads_per_block = 0;
        let mut works = Vec::with_capacity(schedule.len());
        for (chan_id, chan) in schedule {
            if chan.work_queue.is_empty() {
                continue;
            }
            if chan_id.0 as usize >= MCCS_MAX_CHANNELS {
                return Err(GroupError::Internal(format!(
                    "{}: channel {} exceeds the maximum of {}",
                    self.id, chan_id, MCCS_MAX_CHANNELS
                )));
            }
            channel_mask |= 1 << chan_id.0;
            for work in chan.work_queue.iter() {
                let threads = match work {
                    KernelWork::Coll { num_warps, .. } => *num_warps as u32 * 32,
                    KernelWork::P2p { .. } => P2P_THREADS_PER_BLOCK,
                };
                threads_per_block = threads_per_block.max(threads);
            }
            works.push((chan_id, chan.work_queue));
        }
        if works.is_empty() {
            return Ok(None);
        }
        let plan = KernelPlan {
            comm: self.id,
            channel_upper_bound: 64 - channel_mask.leading_zeros(),
            channel_count: channel_mask.count_ones(),
            channel_mask,
            threads_per_block,
            works,
            op_count: self.launch.op_count,
        };
        log::debug!(
            "{}: plan #{} with {} works on {} channels",
            self.id,
            plan.op_count,
            plan.num_works(),
            plan.channel_count
        );
        self.launch.unlaunched_plans.push_back(plan);
        Ok(self.launch.unlaunched_plans.back())
    }

    /// Host-side setup of finalized plans, outside of graph capture:
    /// publishes their work into the work FIFO.
    pub fn enqueue_host_setup(&mut self) {
        while let Some(plan) = self.launch.unlaunched_plans.pop_front() {
            self.launch.work_fifo_head += plan.num_works() as u64;
            self.launch.op_count += 1;
            self.launch.uploaded_plans.push_back(plan);
        }
    }

    pub fn take_launch(&mut self) -> Option<KernelLaunch> {
        self.launch.uploaded_plans.pop_front().map(|plan| KernelLaunch {
            comm: self.id,
            device: self.cuda_dev,
            plan,
        })
    }
}

#[derive(PartialEq, Eq)]
struct ChannelLoad {
    id: ChannelId,
    coll_bytes: usize,
}

impl PartialOrd for ChannelLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.coll_bytes.cmp(&other.coll_bytes) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.id.0.cmp(&other.id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::test_comm;
    use crate::group::sched::P2pScheduler;

    fn all_reduce(count: usize) -> CollTask {
        CollTask {
            func: TaskFuncType::AllReduce,
            send_buf: DevicePtr::new(0x1000),
            recv_buf: DevicePtr::new(0x2000),
            count,
            root: 0,
            data_type: TaskDataType::Float32,
            reduce_op: None,
        }
    }

    #[test]
    fn coll_tasks_balance_channels() {
        let mut comm = test_comm(0, 2);
        comm.profile.num_channels = 2;
        comm.task_queue.coll_queue.push_back(all_reduce(16));
        comm.task_queue.coll_queue.push_back(all_reduce(16));
        let plan = comm.finalize_plan().unwrap().unwrap();
        assert_eq!(plan.channel_count, 2);
        assert_eq!(plan.channel_mask, 0b11);
        assert_eq!(comm.launch.coll_op_count, 2);
    }

    #[test]
    fn p2p_work_is_merged_per_channel() {
        let mut comm = test_comm(0, 2);
        for i in 0..(MCCS_MAX_ELEMENTS_PER_WORK + 1) {
            comm.enqueue_send(0, DevicePtr::new(0x1000 + i), 4).unwrap();
            comm.enqueue_recv(0, DevicePtr::new(0x8000 + i), 4).unwrap();
        }
        let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p).unwrap();
        for desc in descs.iter() {
            comm.setup_p2p_transfer(desc);
        }
        let plan = comm.finalize_plan().unwrap().unwrap();
        assert_eq!(plan.channel_mask, 1);
        assert_eq!(plan.num_works(), 2);
        let elems: Vec<_> = plan.works[0].1.iter().map(KernelWork::num_elems).collect();
        assert_eq!(elems, vec![MCCS_MAX_ELEMENTS_PER_WORK, 1]);
        assert_eq!(plan.threads_per_block, P2P_THREADS_PER_BLOCK);
        // self transfers never go through the proxy
        assert_eq!(comm.proxy.num_pending(), 0);
    }

    #[test]
    fn net_transfers_save_proxy_ops() {
        let mut comm = test_comm(0, 2);
        let bytes = comm.profile.p2p_net_threshold * 2;
        comm.enqueue_send(1, DevicePtr::new(0x1000), bytes).unwrap();
        let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p).unwrap();
        for desc in descs.iter() {
            comm.setup_p2p_transfer(desc);
        }
        assert_eq!(comm.proxy.num_pending(), descs.len());
        assert!(comm
            .proxy
            .pending()
            .all(|op| op.peer == 1 && op.conn_index == ConnIndex::P2pNet));
    }

    #[test]
    fn host_setup_uploads_plans() {
        let mut comm = test_comm(0, 1);
        assert!(comm.finalize_plan().unwrap().is_none());
        comm.task_queue.coll_queue.push_back(all_reduce(1024));
        comm.finalize_plan().unwrap();
        comm.enqueue_host_setup();
        assert!(comm.launch.unlaunched_plans.is_empty());
        assert_eq!(comm.launch.op_count, 1);
        let launch = comm.take_launch().unwrap();
        assert_eq!(launch.comm, comm.id);
        assert!(comm.take_launch().is_none());
    }
}
