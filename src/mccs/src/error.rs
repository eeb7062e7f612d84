use std::fmt;

use thiserror::Error;

use crate::transport::ConnIndex;

/// Numeric status codes of the C API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    UnhandledCudaError = 1,
    SystemError = 2,
    InternalError = 3,
    InvalidArgument = 4,
    InvalidUsage = 5,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device call {call} failed with code {code}")]
pub struct DeviceError {
    pub call: &'static str,
    pub code: i32,
}

impl DeviceError {
    pub fn new(call: &'static str, code: i32) -> Self {
        DeviceError { call, code }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("System error: {0}")]
    System(String),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Transport setup failed on {conn_index:?}: {reason}")]
    Transport { conn_index: ConnIndex, reason: String },
    #[error("Communicator init failed for rank {rank}: {reason}")]
    Init { rank: usize, reason: String },
}

impl GroupError {
    pub fn code(&self) -> ResultCode {
        match self {
            GroupError::InvalidUsage(_) => ResultCode::InvalidUsage,
            GroupError::InvalidArgument(_) => ResultCode::InvalidArgument,
            GroupError::System(_) => ResultCode::SystemError,
            GroupError::Device(_) => ResultCode::UnhandledCudaError,
            GroupError::Internal(_) => ResultCode::InternalError,
            GroupError::Transport { .. } | GroupError::Init { .. } => ResultCode::InternalError,
        }
    }

    pub(crate) fn invalid_usage(msg: impl fmt::Display) -> Self {
        GroupError::InvalidUsage(msg.to_string())
    }

    pub(crate) fn invalid_argument(msg: impl fmt::Display) -> Self {
        GroupError::InvalidArgument(msg.to_string())
    }
}

/// First failure of a group. Never overwritten by a later result.
#[derive(Debug, Default)]
pub struct StickyError(Option<GroupError>);

impl StickyError {
    pub fn record<T>(&mut self, res: Result<T, GroupError>) -> Result<T, GroupError> {
        if let Err(ref e) = res {
            if self.0.is_none() {
                self.0 = Some(e.clone());
            }
        }
        res
    }

    pub fn set(&mut self, err: GroupError) {
        if self.0.is_none() {
            self.0 = Some(err);
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<&GroupError> {
        self.0.as_ref()
    }

    pub fn take(&mut self) -> Option<GroupError> {
        self.0.take()
    }

    pub fn into_result(self) -> Result<(), GroupError> {
        match self.0 {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let mut sticky = StickyError::default();
        assert!(sticky.record(Ok::<_, GroupError>(())).is_ok());
        assert!(sticky.is_ok());
        let _ = sticky.record::<()>(Err(GroupError::invalid_usage("first")));
        let _ = sticky.record::<()>(Err(GroupError::System("second".into())));
        let _ = sticky.record(Ok::<_, GroupError>(()));
        assert_eq!(sticky.get(), Some(&GroupError::InvalidUsage("first".into())));
    }

    #[test]
    fn result_codes() {
        assert_eq!(
            GroupError::Device(DeviceError::new("launch", 700)).code(),
            ResultCode::UnhandledCudaError
        );
        assert_eq!(GroupError::invalid_usage("x").code() as i32, 5);
        assert_eq!(GroupError::System("x".into()).code() as i32, 2);
    }
}
