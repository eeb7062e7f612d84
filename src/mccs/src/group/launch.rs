//! Kernel launch of a closing group.
//!
//! Launching runs in strictly ordered passes over the group's
//! communicators:
//! 1. capture reconciliation and plan finalization (may still roll back),
//! 2. host-side setup of the plans,
//! 3. barrier check-in, submission by the last arriver of each clique,
//!    and wait-out of the others,
//! 4. completion: event recording, proxy op posting and launch reset.
//!
//! The barrier check-in and wait-out never call into the device, so a
//! concurrent device-memory call of another thread cannot deadlock with a
//! pending cooperative launch.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use spin::Mutex;

use super::Backend;
use crate::comm::{CommHandle, Communicator};
use crate::device::CaptureId;
use crate::error::{GroupError, StickyError};
use crate::proxy::plan::KernelLaunch;

/// Communicators of one session living in this process. Their kernels are
/// submitted together, by whichever member checks in last.
pub struct IntraClique {
    size: usize,
    arrived: AtomicUsize,
    phase: AtomicU64,
    staged: Mutex<Vec<KernelLaunch>>,
    failure: Mutex<Option<GroupError>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CliqueTicket {
    phase: u64,
    pub last: bool,
}

impl IntraClique {
    pub fn new(size: usize) -> Self {
        IntraClique {
            size: size.max(1),
            arrived: AtomicUsize::new(0),
            phase: AtomicU64::new(0),
            staged: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stages `launch` and counts the caller in.
    pub fn check_in(&self, launch: Option<KernelLaunch>) -> CliqueTicket {
        // stable until every member, the caller included, has arrived
        let phase = self.phase.load(Ordering::Acquire);
        if let Some(launch) = launch {
            self.staged.lock().push(launch);
        }
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        CliqueTicket {
            phase,
            last: arrived == self.size,
        }
    }

    pub fn take_staged(&self) -> Vec<KernelLaunch> {
        std::mem::take(&mut *self.staged.lock())
    }

    /// Opens the barrier for the members waiting on the current phase.
    pub fn release(&self, status: Result<(), GroupError>) {
        *self.failure.lock() = status.err();
        self.arrived.store(0, Ordering::Release);
        self.phase.fetch_add(1, Ordering::AcqRel);
    }

    pub fn wait_out(&self, ticket: &CliqueTicket) -> Result<(), GroupError> {
        let backoff = Backoff::new();
        while self.phase.load(Ordering::Acquire) == ticket.phase {
            backoff.snooze();
        }
        match &*self.failure.lock() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for IntraClique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntraClique")
            .field("size", &self.size)
            .field("arrived", &self.arrived.load(Ordering::Relaxed))
            .field("phase", &self.phase.load(Ordering::Relaxed))
            .finish()
    }
}

/// Reconciles capture mode and finalizes the plans of every communicator.
/// Nothing has reached the device yet, so a failure here can be rolled
/// back.
pub(crate) fn prepare(backend: &Backend, comms: &[CommHandle]) -> Result<(), GroupError> {
    let mut capture: Option<(Option<CaptureId>, usize)> = None;
    for handle in comms.iter() {
        let mut comm = handle.lock();
        backend.device.select_device(comm.cuda_dev)?;
        let active = backend.device.active_capture(comm.id)?;
        match capture {
            None => capture = Some((active, comm.rank)),
            Some((expected, rank)) if expected != active => {
                log::warn!(
                    "{}: capture {:?} does not match {:?} of rank {}",
                    comm.id,
                    active,
                    expected,
                    rank
                );
                return Err(GroupError::invalid_usage(
                    "mixing graph captured and uncaptured communicators in one group",
                ));
            }
            Some(_) => {}
        }
        comm.capture.using_graph = active.is_some();
        comm.capture.last_capture = active;
    }
    for handle in comms.iter() {
        handle.lock().finalize_plan()?;
    }
    Ok(())
}

fn host_setup(backend: &Backend, comm: &mut Communicator) -> Result<(), GroupError> {
    match comm.capture.last_capture.filter(|_| comm.capture.using_graph) {
        Some(capture) => {
            backend.device.select_device(comm.cuda_dev)?;
            while let Some(plan) = comm.launch.unlaunched_plans.pop_front() {
                backend
                    .device
                    .register_host_setup_node(comm.id, capture, &plan)?;
                comm.launch.op_count += 1;
                comm.launch.uploaded_plans.push_back(plan);
            }
        }
        None => comm.enqueue_host_setup(),
    }
    Ok(())
}

/// Runs the device passes. Failures are recorded into `sticky`; the
/// barrier of every clique is completed regardless.
pub(crate) fn launch(backend: &Backend, comms: &[CommHandle], sticky: &mut StickyError) {
    let mut status = Ok(());
    for handle in comms.iter() {
        status = host_setup(backend, &mut handle.lock());
        if status.is_err() {
            break;
        }
    }

    // check-in, no device calls
    let tickets: Vec<_> = comms
        .iter()
        .map(|handle| {
            let mut comm = handle.lock();
            let launch = if status.is_ok() {
                comm.take_launch()
            } else {
                None
            };
            (comm.clique.clone(), comm.clique.check_in(launch))
        })
        .collect();

    // submission by the last arriver
    for (clique, ticket) in tickets.iter() {
        if !ticket.last {
            continue;
        }
        let launches = clique.take_staged();
        let res = match (&status, launches.first()) {
            (Ok(()), Some(first)) => backend
                .device
                .select_device(first.device)
                .map_err(GroupError::from)
                .and_then(|_| backend.device.launch(&launches)),
            (Ok(()), None) => Ok(()),
            (Err(e), _) => Err(e.clone()),
        };
        if launches.len() > 1 {
            log::debug!(
                "cooperative launch over {} communicators: {:?}",
                launches.len(),
                res
            );
        }
        clique.release(res.clone());
        if status.is_ok() {
            status = res;
        }
    }

    for (clique, ticket) in tickets.iter() {
        if ticket.last {
            continue;
        }
        let res = clique.wait_out(ticket);
        if status.is_ok() {
            status = res;
        }
    }

    if status.is_ok() {
        status = complete(backend, comms);
    }
    if let Err(e) = sticky.record(status) {
        for handle in comms.iter() {
            let mut comm = handle.lock();
            log::warn!("{}: launch failed, communicator unusable: {}", comm.id, e);
            comm.proxy.return_pending();
            comm.launch_reset();
            if comm.fatal_error.is_none() {
                comm.fatal_error = Some(e.clone());
            }
        }
    }
}

fn complete(backend: &Backend, comms: &[CommHandle]) -> Result<(), GroupError> {
    for handle in comms.iter() {
        let mut comm = handle.lock();
        backend.device.select_device(comm.cuda_dev)?;
        backend.device.record_event(comm.id)?;
        let ops = comm.proxy.take_pending();
        if !ops.is_empty() {
            backend.proxy.post(comm.id, ops);
        }
        comm.launch_reset();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::comm::tests::test_comm;

    fn empty_launch(comm: &Communicator) -> KernelLaunch {
        KernelLaunch {
            comm: comm.id,
            device: comm.cuda_dev,
            plan: crate::proxy::plan::KernelPlan {
                comm: comm.id,
                channel_upper_bound: 0,
                channel_count: 0,
                channel_mask: 0,
                threads_per_block: 0,
                works: Vec::new(),
                op_count: 0,
            },
        }
    }

    #[test]
    fn singleton_clique_is_always_last() {
        let clique = IntraClique::new(1);
        for _ in 0..3 {
            let ticket = clique.check_in(None);
            assert!(ticket.last);
            clique.release(Ok(()));
        }
    }

    #[test]
    fn last_arriver_collects_all_launches() {
        let clique = IntraClique::new(2);
        let (a, b) = (test_comm(0, 2), test_comm(1, 2));
        let first = clique.check_in(Some(empty_launch(&a)));
        let second = clique.check_in(Some(empty_launch(&b)));
        assert!(!first.last);
        assert!(second.last);
        let staged = clique.take_staged();
        assert_eq!(staged.iter().map(|l| l.comm).collect::<Vec<_>>(), vec![a.id, b.id]);
        clique.release(Ok(()));
        assert!(clique.wait_out(&first).is_ok());
    }

    #[test]
    fn waiters_see_the_launch_failure() {
        let clique = Arc::new(IntraClique::new(2));
        let ticket = clique.check_in(None);
        let other = Arc::clone(&clique);
        let last = thread::spawn(move || {
            let ticket = other.check_in(None);
            assert!(ticket.last);
            other.release(Err(GroupError::System("launch".into())));
        });
        let res = clique.wait_out(&ticket);
        last.join().unwrap();
        assert_eq!(res, Err(GroupError::System("launch".into())));
    }
}
