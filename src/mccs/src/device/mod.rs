pub mod affinity;
pub mod ptr;

pub use affinity::CoreMask;
pub use ptr::DevicePtr;

use crate::comm::CommunicatorId;
use crate::error::{DeviceError, GroupError};
use crate::proxy::plan::{KernelLaunch, KernelPlan};

pub type DeviceIdx = i32;

/// Identifier of an active stream capture (graph being recorded).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CaptureId(pub u64);

/// Device driver calls the group engine issues.
///
/// Device selection is per calling thread, as with the CUDA runtime.
pub trait DeviceRuntime: Send + Sync {
    fn current_device(&self) -> Result<DeviceIdx, DeviceError>;

    fn select_device(&self, device: DeviceIdx) -> Result<(), DeviceError>;

    /// Capture active on the communicator's stream, if any.
    fn active_capture(&self, comm: CommunicatorId) -> Result<Option<CaptureId>, GroupError>;

    /// Records host-side setup of `plan` as a host node of the captured graph.
    fn register_host_setup_node(
        &self,
        comm: CommunicatorId,
        capture: CaptureId,
        plan: &KernelPlan,
    ) -> Result<(), GroupError>;

    /// Submits kernels. More than one entry means a cooperative launch over
    /// every communicator of a process-local clique.
    fn launch(&self, launches: &[KernelLaunch]) -> Result<(), GroupError>;

    fn record_event(&self, comm: CommunicatorId) -> Result<(), GroupError>;
}

#[macro_export]
macro_rules! device_warning {
    ($device_op:expr) => {{
        if let Err(e) = $device_op {
            log::error!("Device call failed with {} at {}:{}.", e, file!(), line!())
        }
    }};
    ($device_op:expr,$ctx:expr) => {{
        if let Err(e) = $device_op {
            log::error!(
                "Device call failed with {} at {}:{}. Context={}",
                e,
                file!(),
                line!(),
                $ctx
            )
        }
    }};
}
