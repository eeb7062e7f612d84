use std::collections::VecDeque;

use crate::device::DevicePtr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskFuncType {
    Broadcast = 0,
    Reduce = 1,
    AllGather = 2,
    ReduceScatter = 3,
    AllReduce = 4,
    SendRecv = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskDataType {
    Int8 = 0,
    Uint8 = 1,
    Int32 = 2,
    Uint32 = 3,
    Int64 = 4,
    Uint64 = 5,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
}

impl TaskDataType {
    pub fn count_bytes(&self) -> usize {
        match self {
            TaskDataType::Int8 | TaskDataType::Uint8 => 1,
            TaskDataType::Float16 => 2,
            TaskDataType::Int32 | TaskDataType::Uint32 | TaskDataType::Float32 => 4,
            TaskDataType::Int64 | TaskDataType::Uint64 | TaskDataType::Float64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskReduceOpType {
    Sum = 0,
    Prod = 1,
    Max = 2,
    Min = 3,
    PreMulSum = 4,
    SumPostDiv = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReduceOp {
    pub op: TaskReduceOpType,
    pub arg: u64,
}

#[derive(Debug, Clone)]
pub struct CollTask {
    pub func: TaskFuncType,
    pub send_buf: Option<DevicePtr>,
    pub recv_buf: Option<DevicePtr>,
    pub count: usize,
    pub root: usize,
    pub data_type: TaskDataType,
    pub reduce_op: Option<TaskReduceOp>,
}

impl CollTask {
    pub fn total_bytes(&self, n_rank: usize) -> usize {
        let n_bytes = self.count * self.data_type.count_bytes();
        match self.func {
            TaskFuncType::AllGather | TaskFuncType::ReduceScatter => n_bytes * n_rank,
            TaskFuncType::AllReduce
            | TaskFuncType::Broadcast
            | TaskFuncType::Reduce
            | TaskFuncType::SendRecv => n_bytes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAlgorithm {
    Ring = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskProtocol {
    Simple = 0,
}

#[derive(Debug, Clone)]
pub struct TaskSchema {
    pub algorithm: TaskAlgorithm,
    pub protocol: TaskProtocol,
    pub num_channels: u32,
    pub num_threads: u32,
}

impl TaskSchema {
    const MAX_THREADS: usize = 512;
    const THREAD_THRESHOLD: usize = 64;

    /// Shrinks channel and thread counts until every thread gets at least
    /// `THREAD_THRESHOLD` bytes.
    pub fn for_task(task: &CollTask, num_ranks: usize, max_channels: u32) -> Self {
        let num_bytes = task.total_bytes(num_ranks);
        let mut nc = max_channels.max(1) as usize;
        let mut nt = Self::MAX_THREADS;
        while num_bytes < nc * nt * Self::THREAD_THRESHOLD {
            if nc >= 2 {
                nc -= 1;
            } else if (nt % 128) == 0 {
                nt /= 2;
            } else {
                break;
            }
        }
        nt = if nt + 32 > Self::MAX_THREADS {
            Self::MAX_THREADS
        } else {
            nt + 32
        };
        TaskSchema {
            algorithm: TaskAlgorithm::Ring,
            protocol: TaskProtocol::Simple,
            num_channels: nc as _,
            num_threads: nt as _,
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    pub coll_queue: VecDeque<CollTask>,
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn small_tasks_use_one_channel() {
        let schema = TaskSchema::for_task(&all_reduce(16), 4, 8);
        assert_eq!(schema.num_channels, 1);
        assert!(schema.num_threads <= 512);
    }

    #[test]
    fn large_tasks_use_all_channels() {
        let schema = TaskSchema::for_task(&all_reduce(64 << 20), 4, 8);
        assert_eq!(schema.num_channels, 8);
        assert_eq!(schema.num_threads, 512);
    }

    #[test]
    fn all_gather_bytes_scale_with_ranks() {
        let mut task = all_reduce(10);
        task.func = TaskFuncType::AllGather;
        assert_eq!(task.total_bytes(4), 160);
    }
}
