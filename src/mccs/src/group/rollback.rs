use super::AsyncOp;

/// Undoes everything the recorded operations queued. Every record is
/// visited, whatever state its communicator is in.
pub(crate) fn rollback(ops: &[AsyncOp]) {
    for op in ops.iter() {
        match op {
            AsyncOp::Init(init) => {
                if let Some(comm) = init.slot.take() {
                    comm.destroy();
                }
            }
            AsyncOp::Coll(coll) => {
                let mut comm = coll.comm.lock();
                comm.async_op_count = 0;
                comm.async_total_size = 0;
                let dropped = comm.p2p.recycle_all();
                let returned = comm.proxy.return_pending();
                comm.launch_reset();
                log::debug!(
                    "{}: rolled back {} P2P ops and {} proxy ops",
                    comm.id,
                    dropped,
                    returned
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::test_comm;
    use crate::comm::{CommHandle, CommSlot, InitArgs, UniqueId};
    use crate::config::DefaultCommConfig;
    use crate::device::DevicePtr;
    use crate::group::sched::P2pScheduler;
    use crate::group::{CollOp, InitOp};
    use crate::proxy::task::{CollTask, TaskDataType, TaskFuncType};
    use crate::sim::sim_comm_init;

    #[test]
    fn rollback_clears_everything_queued() {
        let comm = CommHandle::new(test_comm(0, 2));
        {
            let mut comm = comm.lock();
            let bytes = comm.profile.p2p_net_threshold * 2;
            comm.enqueue_send(1, DevicePtr::new(0x1000), bytes).unwrap();
            comm.enqueue_recv(1, DevicePtr::new(0x2000), 64).unwrap();
            let descs = P2pScheduler::new(&comm).schedule(&mut comm.p2p).unwrap();
            for desc in descs.iter() {
                comm.setup_p2p_transfer(desc);
            }
            comm.enqueue_send(1, DevicePtr::new(0x3000), 8).unwrap();
            comm.enqueue_coll(
                CollTask {
                    func: TaskFuncType::AllReduce,
                    send_buf: DevicePtr::new(0x4000),
                    recv_buf: DevicePtr::new(0x4000),
                    count: 4,
                    root: 0,
                    data_type: TaskDataType::Float32,
                    reduce_op: None,
                },
                None,
            )
            .unwrap();
            assert!(comm.proxy.num_pending() > 0);
        }
        let slot = CommSlot::new();
        let args = InitArgs {
            unique_id: UniqueId::from_u64(9),
            num_ranks: 1,
            rank: 0,
            cuda_dev: 0,
            clique: None,
        };
        let ctor = sim_comm_init(DefaultCommConfig::default(), None);
        slot.set(CommHandle::new(ctor(&args).unwrap()));

        let ops = vec![
            AsyncOp::Init(InitOp {
                ctor,
                args,
                slot: slot.clone(),
            }),
            AsyncOp::Coll(CollOp {
                comm: comm.clone(),
                conn_index: None,
            }),
        ];
        rollback(&ops);

        assert!(slot.is_empty());
        let comm = comm.lock();
        assert!(!comm.p2p.has_pending());
        assert_eq!(comm.p2p.num_allocated(), 0);
        assert_eq!(comm.proxy.num_pending(), 0);
        assert!(comm.proxy.num_free() > 0);
        assert_eq!((comm.async_op_count, comm.async_total_size), (0, 0));
        assert!(comm.task_queue.coll_queue.is_empty());
        assert!(comm.launch.plan_schedule.is_empty());
    }
}
