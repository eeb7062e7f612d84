pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod group;
pub mod proxy;
pub mod sim;
pub mod transport;

pub use comm::{CommHandle, CommInitFn, CommSlot, Communicator, CommunicatorId, InitArgs, UniqueId};
pub use error::{GroupError, ResultCode};
pub use group::{Backend, GroupState};
