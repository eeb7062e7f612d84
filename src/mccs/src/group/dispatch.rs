//! Worker threads for communicator init and peer pre-connection.

use std::thread::{self, JoinHandle};

use super::{AsyncOp, Backend};
use crate::comm::{CommHandle, Communicator};
use crate::error::{GroupError, StickyError};
use crate::transport::ConnIndex;

fn join_worker(handle: JoinHandle<Result<(), GroupError>>) -> Result<(), GroupError> {
    let name = handle.thread().name().unwrap_or("worker").to_owned();
    handle
        .join()
        .unwrap_or_else(|_| Err(GroupError::System(format!("{} panicked", name))))
}

/// Runs every pending communicator constructor on its own thread and
/// publishes the successful ones into their slots. All threads are joined
/// before returning; the first failure is recorded.
pub(crate) fn run_inits(backend: &Backend, ops: &[AsyncOp], sticky: &mut StickyError) {
    let mut pending = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        let AsyncOp::Init(init) = op else { continue };
        let ctor = init.ctor.clone();
        let args = init.args.clone();
        let slot = init.slot.clone();
        let device = backend.device.clone();
        let spawned = thread::Builder::new()
            .name(format!("mccs-group-init-{}", i))
            .spawn(move || -> Result<(), GroupError> {
                device.select_device(args.cuda_dev)?;
                let comm = ctor(&args)?;
                slot.set(CommHandle::new(comm));
                Ok(())
            });
        match spawned {
            Ok(handle) => pending.push(handle),
            Err(e) => {
                sticky.set(GroupError::System(format!("failed to spawn init thread: {}", e)));
                break;
            }
        }
    }
    if pending.is_empty() {
        return;
    }
    log::debug!("waiting for {} communicator init threads", pending.len());

    // poll without blocking on any single thread
    while !pending.is_empty() {
        let mut i = 0;
        while i < pending.len() {
            if pending[i].is_finished() {
                let res = join_worker(pending.swap_remove(i));
                if let Err(e) = sticky.record(res) {
                    log::warn!("communicator init failed: {}", e);
                }
            } else {
                i += 1;
            }
        }
        thread::yield_now();
    }
}

fn connect(backend: &Backend, comm: &mut Communicator, conn_index: ConnIndex) -> Result<(), GroupError> {
    backend.device.select_device(comm.cuda_dev)?;
    if let Some(mask) = comm.cpu_affinity.as_ref() {
        if let Err(e) = mask.sched_set_affinity_for_current_thread() {
            log::warn!("{}: failed to set cpu affinity {}: {}", comm.id, mask, e);
        }
    }
    backend.transport.setup_p2p(comm, conn_index)?;
    let connected = comm.mark_connected(conn_index);
    log::info!(
        "{}: rank {} connected {} P2P channels on {:?}",
        comm.id,
        comm.rank,
        connected,
        conn_index
    );
    Ok(())
}

/// Sets up the peer connections requested on `conn_index` by every
/// communicator of the group, one thread per communicator.
pub(crate) fn preconnect(
    backend: &Backend,
    ops: &mut [AsyncOp],
    conn_index: ConnIndex,
    sticky: &mut StickyError,
) {
    let mut pending = Vec::new();
    for (i, op) in ops.iter_mut().enumerate() {
        let AsyncOp::Coll(coll) = op else { continue };
        if !coll.comm.lock().needs_connect(conn_index) {
            continue;
        }
        let comm = coll.comm.clone();
        let worker_backend = backend.clone();
        let spawned = thread::Builder::new()
            .name(format!("mccs-group-connect-{}", i))
            .spawn(move || {
                let mut comm = comm.lock();
                connect(&worker_backend, &mut comm, conn_index)
            });
        match spawned {
            Ok(handle) => {
                coll.conn_index = Some(conn_index);
                pending.push((i, handle));
            }
            Err(e) => {
                sticky.set(GroupError::System(format!("failed to spawn connect thread: {}", e)));
                break;
            }
        }
    }

    for (i, handle) in pending {
        if let Err(e) = sticky.record(join_worker(handle)) {
            log::warn!("pre-connect of operation {} on {:?} failed: {}", i, conn_index, e);
        }
        if let AsyncOp::Coll(coll) = &mut ops[i] {
            coll.conn_index = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::tests::test_comm;
    use crate::comm::{CommSlot, InitArgs, UniqueId};
    use crate::config::DefaultCommConfig;
    use crate::device::DevicePtr;
    use crate::group::{CollOp, InitOp};
    use crate::sim::{sim_comm_init, SimCluster};

    fn init_op(rank: usize, num_ranks: usize, fail_rank: Option<usize>) -> (AsyncOp, CommSlot) {
        let slot = CommSlot::new();
        let op = AsyncOp::Init(InitOp {
            ctor: sim_comm_init(DefaultCommConfig::default(), fail_rank),
            args: InitArgs {
                unique_id: UniqueId::from_u64(3),
                num_ranks,
                rank,
                cuda_dev: rank as _,
                clique: None,
            },
            slot: slot.clone(),
        });
        (op, slot)
    }

    #[test]
    fn inits_publish_into_slots() {
        let (_cluster, backend) = SimCluster::new(4);
        let (ops, slots): (Vec<_>, Vec<_>) = (0..4).map(|r| init_op(r, 4, None)).unzip();
        let mut sticky = StickyError::default();
        run_inits(&backend, &ops, &mut sticky);
        assert!(sticky.is_ok());
        for (rank, slot) in slots.iter().enumerate() {
            assert_eq!(slot.get().unwrap().lock().rank, rank);
        }
    }

    #[test]
    fn init_failure_is_sticky_and_others_finish() {
        let (_cluster, backend) = SimCluster::new(4);
        let (ops, slots): (Vec<_>, Vec<_>) = (0..3).map(|r| init_op(r, 3, Some(1))).unzip();
        let mut sticky = StickyError::default();
        run_inits(&backend, &ops, &mut sticky);
        assert!(matches!(sticky.get(), Some(GroupError::Init { rank: 1, .. })));
        assert!(slots[1].is_empty());
        assert!(!slots[0].is_empty() && !slots[2].is_empty());
    }

    #[test]
    fn preconnect_marks_requests_connected() {
        let (cluster, backend) = SimCluster::new(4);
        let comm = CommHandle::new(test_comm(0, 2));
        comm.lock().enqueue_send(1, DevicePtr::new(0x1000), 16).unwrap();
        let mut ops = vec![AsyncOp::Coll(CollOp {
            comm: comm.clone(),
            conn_index: None,
        })];
        let mut sticky = StickyError::default();
        preconnect(&backend, &mut ops, ConnIndex::P2pNet, &mut sticky);
        assert!(cluster.transport.setups().is_empty());
        preconnect(&backend, &mut ops, ConnIndex::Default, &mut sticky);
        assert!(sticky.is_ok());
        assert!(!comm.lock().needs_connect(ConnIndex::Default));
        assert_eq!(cluster.transport.setups().len(), 1);
    }

    #[test]
    fn preconnect_failure_keeps_requests() {
        let (cluster, backend) = SimCluster::new(4);
        let comm = CommHandle::new(test_comm(0, 2));
        let id = comm.lock().id;
        comm.lock().enqueue_recv(1, DevicePtr::new(0x1000), 16).unwrap();
        cluster.transport.fail_on(id, ConnIndex::Default);
        let mut ops = vec![AsyncOp::Coll(CollOp {
            comm: comm.clone(),
            conn_index: None,
        })];
        let mut sticky = StickyError::default();
        preconnect(&backend, &mut ops, ConnIndex::Default, &mut sticky);
        assert!(matches!(
            sticky.get(),
            Some(GroupError::Transport { conn_index: ConnIndex::Default, .. })
        ));
        assert!(comm.lock().needs_connect(ConnIndex::Default));
    }
}
