//! Host-only backend. Records what the engine asks of the device, the
//! transport and the proxy, and fails on request.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use spin::Mutex;

use crate::comm::{CommInitFn, Communicator, CommunicatorId, InitArgs};
use crate::config::DefaultCommConfig;
use crate::device::{CaptureId, DeviceIdx, DeviceRuntime};
use crate::error::{DeviceError, GroupError};
use crate::group::Backend;
use crate::proxy::plan::{KernelLaunch, KernelPlan};
use crate::proxy::{ProxyOp, ProxyProgress};
use crate::transport::{ConnIndex, TransportSetup};

// cudaErrorInvalidDevice
const INVALID_DEVICE: i32 = 101;
// cudaErrorLaunchFailure
const LAUNCH_FAILURE: i32 = 719;

thread_local! {
    static CURRENT_DEVICE: Cell<DeviceIdx> = Cell::new(0);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    Select(DeviceIdx),
    ActiveCapture(CommunicatorId),
    RegisterHostNode { comm: CommunicatorId, capture: CaptureId, num_works: usize },
    Launch { comms: Vec<CommunicatorId>, devices: Vec<DeviceIdx> },
    RecordEvent { comm: CommunicatorId, device: DeviceIdx },
}

pub struct SimDevice {
    num_devices: DeviceIdx,
    captures: Mutex<HashMap<CommunicatorId, CaptureId>>,
    calls: Mutex<Vec<DeviceCall>>,
    fail_launch: AtomicBool,
    fail_host_node: AtomicBool,
}

impl SimDevice {
    pub fn new(num_devices: usize) -> Self {
        SimDevice {
            num_devices: num_devices as _,
            captures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
            fail_host_node: AtomicBool::new(false),
        }
    }

    /// Starts or stops capturing the stream of `comm`.
    pub fn set_capture(&self, comm: CommunicatorId, capture: Option<CaptureId>) {
        let mut captures = self.captures.lock();
        match capture {
            Some(capture) => captures.insert(comm, capture),
            None => captures.remove(&comm),
        };
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_host_node(&self, fail: bool) {
        self.fail_host_node.store(fail, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Communicators of every submitted launch, in order.
    pub fn launches(&self) -> Vec<Vec<CommunicatorId>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Launch { comms, .. } => Some(comms.clone()),
                _ => None,
            })
            .collect()
    }

    fn log(&self, call: DeviceCall) {
        log::trace!("sim device: {:?}", call);
        self.calls.lock().push(call);
    }
}

impl DeviceRuntime for SimDevice {
    fn current_device(&self) -> Result<DeviceIdx, DeviceError> {
        Ok(CURRENT_DEVICE.with(|dev| dev.get()))
    }

    fn select_device(&self, device: DeviceIdx) -> Result<(), DeviceError> {
        if device < 0 || device >= self.num_devices {
            return Err(DeviceError::new("cudaSetDevice", INVALID_DEVICE));
        }
        CURRENT_DEVICE.with(|dev| dev.set(device));
        self.log(DeviceCall::Select(device));
        Ok(())
    }

    fn active_capture(&self, comm: CommunicatorId) -> Result<Option<CaptureId>, GroupError> {
        self.log(DeviceCall::ActiveCapture(comm));
        Ok(self.captures.lock().get(&comm).copied())
    }

    fn register_host_setup_node(
        &self,
        comm: CommunicatorId,
        capture: CaptureId,
        plan: &KernelPlan,
    ) -> Result<(), GroupError> {
        if self.fail_host_node.load(Ordering::Relaxed) {
            return Err(DeviceError::new("cudaGraphAddHostNode", LAUNCH_FAILURE).into());
        }
        self.log(DeviceCall::RegisterHostNode {
            comm,
            capture,
            num_works: plan.num_works(),
        });
        Ok(())
    }

    fn launch(&self, launches: &[KernelLaunch]) -> Result<(), GroupError> {
        if self.fail_launch.load(Ordering::Relaxed) {
            return Err(DeviceError::new("cudaLaunchKernel", LAUNCH_FAILURE).into());
        }
        self.log(DeviceCall::Launch {
            comms: launches.iter().map(|l| l.comm).collect(),
            devices: launches.iter().map(|l| l.device).collect(),
        });
        Ok(())
    }

    fn record_event(&self, comm: CommunicatorId) -> Result<(), GroupError> {
        let device = self.current_device()?;
        self.log(DeviceCall::RecordEvent { comm, device });
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupRecord {
    pub comm: CommunicatorId,
    pub conn_index: ConnIndex,
    pub num_requests: usize,
    pub thread: Option<String>,
}

#[derive(Default)]
pub struct SimTransport {
    setups: Mutex<Vec<SetupRecord>>,
    fail: Mutex<HashSet<(CommunicatorId, ConnIndex)>>,
}

impl SimTransport {
    pub fn fail_on(&self, comm: CommunicatorId, conn_index: ConnIndex) {
        self.fail.lock().insert((comm, conn_index));
    }

    pub fn setups(&self) -> Vec<SetupRecord> {
        self.setups.lock().clone()
    }
}

impl TransportSetup for SimTransport {
    fn setup_p2p(&self, comm: &Communicator, conn_index: ConnIndex) -> Result<(), GroupError> {
        if self.fail.lock().contains(&(comm.id, conn_index)) {
            return Err(GroupError::Transport {
                conn_index,
                reason: format!("{}: connection refused", comm.id),
            });
        }
        self.setups.lock().push(SetupRecord {
            comm: comm.id,
            conn_index,
            num_requests: comm.connect[conn_index.as_usize()].pending().count(),
            thread: std::thread::current().name().map(str::to_owned),
        });
        Ok(())
    }
}

pub type ProxyBatch = (CommunicatorId, Vec<ProxyOp>);

pub struct SimProxy {
    tx: Sender<ProxyBatch>,
}

impl SimProxy {
    pub fn new() -> (Self, Receiver<ProxyBatch>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (SimProxy { tx }, rx)
    }
}

impl ProxyProgress for SimProxy {
    fn post(&self, comm: CommunicatorId, ops: Vec<ProxyOp>) {
        if self.tx.send((comm, ops)).is_err() {
            log::warn!("{}: proxy batch dropped, receiver gone", comm);
        }
    }
}

/// Simulated collaborators together with the receiving end of the proxy.
pub struct SimCluster {
    pub device: Arc<SimDevice>,
    pub transport: Arc<SimTransport>,
    pub proxy_rx: Receiver<ProxyBatch>,
}

impl SimCluster {
    pub fn new(num_devices: usize) -> (Self, Backend) {
        let device = Arc::new(SimDevice::new(num_devices));
        let transport = Arc::new(SimTransport::default());
        let (proxy, proxy_rx) = SimProxy::new();
        let backend = Backend {
            device: device.clone(),
            transport: transport.clone(),
            proxy: Arc::new(proxy),
        };
        let cluster = SimCluster {
            device,
            transport,
            proxy_rx,
        };
        (cluster, backend)
    }

    pub fn posted_ops(&self) -> Vec<ProxyBatch> {
        self.proxy_rx.try_iter().collect()
    }
}

/// Communicator constructor; fails for `fail_rank`.
pub fn sim_comm_init(config: DefaultCommConfig, fail_rank: Option<usize>) -> CommInitFn {
    Arc::new(move |args: &InitArgs| {
        if fail_rank == Some(args.rank) {
            return Err(GroupError::Init {
                rank: args.rank,
                reason: "bootstrap handshake failed".to_owned(),
            });
        }
        Communicator::new(args, &config)
    })
}
