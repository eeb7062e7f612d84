//! Reduction operators, including user-created ones.
//!
//! User operators are identified by handles scoped to the communicator
//! that created them. A handle carries the id of its communicator and a
//! generation counter, so handles of independent communicators never
//! collide and a freed handle is never mistaken for a later one reusing
//! the same slot.

use super::{CommunicatorId, Communicator};
use crate::device::DevicePtr;
use crate::error::GroupError;
use crate::proxy::task::{TaskDataType, TaskReduceOp, TaskReduceOpType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    Avg,
    User(UserRedOp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserRedOp {
    comm: CommunicatorId,
    slot: u32,
    generation: u32,
}

/// Scalar multiplied into every input of a pre-multiplied sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarArg {
    /// Raw bits of the scalar, held on the host.
    Host(u64),
    /// Scalar resident in device memory.
    Device(DevicePtr),
}

#[derive(Clone, Copy, Debug)]
struct UserRedOpEntry {
    scalar: ScalarArg,
    data_type: TaskDataType,
}

#[derive(Debug, Default)]
pub(crate) struct UserRedOps {
    entries: Vec<(u32, Option<UserRedOpEntry>)>,
    free: Vec<u32>,
}

impl Communicator {
    pub fn create_pre_mul_sum(&mut self, scalar: ScalarArg, data_type: TaskDataType) -> ReduceOp {
        let entry = UserRedOpEntry { scalar, data_type };
        let ops = &mut self.red_ops;
        let slot = match ops.free.pop() {
            Some(slot) => {
                let (generation, ent) = &mut ops.entries[slot as usize];
                *generation = generation.wrapping_add(1);
                *ent = Some(entry);
                slot
            }
            None => {
                ops.entries.push((0, Some(entry)));
                (ops.entries.len() - 1) as u32
            }
        };
        ReduceOp::User(UserRedOp {
            comm: self.id,
            slot,
            generation: ops.entries[slot as usize].0,
        })
    }

    fn lookup_red_op(&self, op: &UserRedOp) -> Result<&UserRedOpEntry, GroupError> {
        if op.comm != self.id {
            return Err(GroupError::invalid_argument(format!(
                "reduction op belongs to {}, not {}",
                op.comm, self.id
            )));
        }
        match self.red_ops.entries.get(op.slot as usize) {
            Some((generation, Some(entry))) if *generation == op.generation => Ok(entry),
            _ => Err(GroupError::invalid_argument(
                "reduction op was destroyed or never created",
            )),
        }
    }

    pub fn destroy_red_op(&mut self, op: ReduceOp) -> Result<(), GroupError> {
        let user_op = match op {
            ReduceOp::User(user_op) => user_op,
            builtin => {
                return Err(GroupError::invalid_argument(format!(
                    "cannot destroy built-in reduction op {:?}",
                    builtin
                )))
            }
        };
        self.lookup_red_op(&user_op)?;
        self.red_ops.entries[user_op.slot as usize].1 = None;
        self.red_ops.free.push(user_op.slot);
        Ok(())
    }

    /// Device-side form of `op` for a reduction over `data_type`.
    pub fn resolve_red_op(
        &self,
        op: ReduceOp,
        data_type: TaskDataType,
    ) -> Result<TaskReduceOp, GroupError> {
        let (op, arg) = match op {
            ReduceOp::Sum => (TaskReduceOpType::Sum, 0),
            ReduceOp::Prod => (TaskReduceOpType::Prod, 0),
            ReduceOp::Max => (TaskReduceOpType::Max, 0),
            ReduceOp::Min => (TaskReduceOpType::Min, 0),
            ReduceOp::Avg => (TaskReduceOpType::SumPostDiv, self.num_ranks as u64),
            ReduceOp::User(user_op) => {
                let entry = self.lookup_red_op(&user_op)?;
                if entry.data_type != data_type {
                    return Err(GroupError::invalid_argument(format!(
                        "reduction op created for {:?}, used with {:?}",
                        entry.data_type, data_type
                    )));
                }
                let arg = match entry.scalar {
                    ScalarArg::Host(bits) => bits,
                    ScalarArg::Device(ptr) => ptr.addr().get() as u64,
                };
                (TaskReduceOpType::PreMulSum, arg)
            }
        };
        Ok(TaskReduceOp { op, arg })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::test_comm;

    #[test]
    fn builtins_pass_through() {
        let comm = test_comm(0, 4);
        let op = comm.resolve_red_op(ReduceOp::Max, TaskDataType::Int32).unwrap();
        assert_eq!(op.op, TaskReduceOpType::Max);
        let avg = comm.resolve_red_op(ReduceOp::Avg, TaskDataType::Float32).unwrap();
        assert_eq!(avg, TaskReduceOp { op: TaskReduceOpType::SumPostDiv, arg: 4 });
    }

    #[test]
    fn handles_are_scoped_to_their_communicator() {
        let mut a = test_comm(0, 2);
        let mut b = test_comm(1, 2);
        let op_a = a.create_pre_mul_sum(ScalarArg::Host(2), TaskDataType::Float32);
        let op_b = b.create_pre_mul_sum(ScalarArg::Host(3), TaskDataType::Float32);
        assert_ne!(op_a, op_b);
        assert!(a.resolve_red_op(op_b, TaskDataType::Float32).is_err());
        assert_eq!(
            a.resolve_red_op(op_a, TaskDataType::Float32).unwrap(),
            TaskReduceOp { op: TaskReduceOpType::PreMulSum, arg: 2 }
        );
        assert!(b.destroy_red_op(op_a).is_err());
    }

    #[test]
    fn freed_slot_is_reused_without_aliasing() {
        let mut comm = test_comm(0, 2);
        let first = comm.create_pre_mul_sum(ScalarArg::Host(1), TaskDataType::Int32);
        comm.destroy_red_op(first).unwrap();
        assert!(comm.destroy_red_op(first).is_err());

        let second = comm.create_pre_mul_sum(ScalarArg::Host(5), TaskDataType::Int32);
        assert_ne!(first, second);
        assert!(comm.resolve_red_op(first, TaskDataType::Int32).is_err());
        assert_eq!(comm.resolve_red_op(second, TaskDataType::Int32).unwrap().arg, 5);
        assert_eq!(comm.red_ops.entries.len(), 1);
    }

    #[test]
    fn datatype_must_match() {
        let mut comm = test_comm(0, 2);
        let op = comm.create_pre_mul_sum(ScalarArg::Host(1), TaskDataType::Float16);
        assert!(comm.resolve_red_op(op, TaskDataType::Float32).is_err());
        assert!(comm.destroy_red_op(ReduceOp::Sum).is_err());
    }
}
