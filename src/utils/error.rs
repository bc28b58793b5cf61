//! Customized unified error type and protocol-level error codes.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;

use serde::{Deserialize, Serialize};

/// Customized error type for replog. Carries a human-readable description
/// of what went wrong; fatal invariant violations embed the decree, ballot
/// and offset values involved.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplogError(pub(crate) String);

impl ReplogError {
    pub fn msg(msg: impl ToString) -> Self {
        ReplogError(msg.to_string())
    }
}

impl fmt::Display for ReplogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for ReplogError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ReplogError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ReplogError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ReplogError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ReplogError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ReplogError {
            fn from(e: $error) -> ReplogError {
                ReplogError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

/// Protocol-level outcome codes, carried in peer replies and replay results.
/// Unlike `ReplogError`, these describe expected conditions the caller is
/// supposed to branch on.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum ErrorCode {
    Ok,

    /// Clean end of a log file reached.
    HandleEof,

    /// Truncated or checksum-mismatching data; valid up to a boundary.
    IncompleteData,

    /// Data that passed checksums but violates an invariant.
    InvalidData,

    /// Sender's ballot is older than the receiver's.
    VersionOutdated,

    /// Receiver is in no state to handle the request.
    InvalidState,

    /// Prepare window cannot take the decree.
    CapacityExceeded,

    /// Requested data is no longer available.
    ObjectNotFound,

    /// RPC timed out.
    Timeout,

    /// RPC could not be delivered.
    NetworkFailure,
}

impl ErrorCode {
    #[inline]
    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCode::Ok => "ERR_OK",
            ErrorCode::HandleEof => "ERR_HANDLE_EOF",
            ErrorCode::IncompleteData => "ERR_INCOMPLETE_DATA",
            ErrorCode::InvalidData => "ERR_INVALID_DATA",
            ErrorCode::VersionOutdated => "ERR_VERSION_OUTDATED",
            ErrorCode::InvalidState => "ERR_INVALID_STATE",
            ErrorCode::CapacityExceeded => "ERR_CAPACITY_EXCEEDED",
            ErrorCode::ObjectNotFound => "ERR_OBJECT_NOT_FOUND",
            ErrorCode::Timeout => "ERR_TIMEOUT",
            ErrorCode::NetworkFailure => "ERR_NETWORK_FAILURE",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ReplogError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = ReplogError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn code_display() {
        assert_eq!(
            format!("{}", ErrorCode::VersionOutdated),
            "ERR_VERSION_OUTDATED"
        );
        assert!(ErrorCode::Ok.is_ok());
        assert!(!ErrorCode::IncompleteData.is_ok());
    }
}
