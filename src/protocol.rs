//! Control channel wire protocol.
//!
//! # Protocol Format
//!
//! - **Transport**: Unix stream socket
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited (each message ends with `\n`)
//!
//! Requests are the serde form of [`Request`]; several requests may be sent
//! on one connection and each gets exactly one response line.
//!
//! ```text
//! Orchestrator                        Shim
//!   |                                   |
//!   |  {"action":"start"}\n             |
//!   |---------------------------------->|
//!   |                                   |
//!   |  {"status":"ok","data":{"pid":7}}\n
//!   |<----------------------------------|
//!   |                                   |
//! ```
//!
//! Errors carry a stable [`ErrorCode`] and a human-readable message:
//!
//! ```text
//! {"status":"error","code":"invalid_state","message":"cannot start container in state 'running'"}
//! ```

use crate::dispatcher::{Reply, Request};
use crate::error::Error;
use serde::{Deserialize, Serialize};

// =============================================================================
// Response Types
// =============================================================================

/// Response from the shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success response.
    Ok(OkPayload),
    /// Error response.
    Error(ErrorPayload),
}

/// Success payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkPayload {
    /// Reply data, absent for requests without a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Operation not valid in the current state.
    InvalidState,
    /// No container created yet.
    NotCreated,
    /// Bad ID, bundle, runtime or command.
    InvalidArgument,
    /// Runtime process could not be created.
    SpawnFailed,
    NoSuchProcess,
    PermissionDenied,
    /// Forced termination failed during stop.
    TerminationFailed,
    DuplicateExecId,
    NoSuchExec,
    ContainerNotRunning,
    NotSupported,
    /// Resource accounting backend failure.
    ResourceError,
    Timeout,
    /// Malformed or oversized request.
    InvalidRequest,
    Internal,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidState { .. } => Self::InvalidState,
            Error::NotCreated => Self::NotCreated,
            Error::InvalidContainerId { .. }
            | Error::InvalidBundle { .. }
            | Error::InvalidRuntime { .. }
            | Error::InvalidCommand(_) => Self::InvalidArgument,
            Error::ContainerNotRunning { .. } => Self::ContainerNotRunning,
            Error::Spawn(_) => Self::SpawnFailed,
            Error::NoSuchProcess { .. } => Self::NoSuchProcess,
            Error::PermissionDenied { .. } => Self::PermissionDenied,
            Error::TerminationFailed { .. } => Self::TerminationFailed,
            Error::DuplicateExecId(_) => Self::DuplicateExecId,
            Error::NoSuchExec(_) => Self::NoSuchExec,
            Error::Resource(_) => Self::ResourceError,
            Error::NotSupported(_) => Self::NotSupported,
            Error::Timeout { .. } => Self::Timeout,
            Error::Serialization(_) => Self::InvalidRequest,
            Error::Io(_) | Error::Internal(_) => Self::Internal,
        }
    }
}

impl Response {
    /// Creates a success response with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok(OkPayload { data: None })
    }

    /// Creates a success response with data.
    #[must_use]
    pub fn ok_with_data(data: serde_json::Value) -> Self {
        Self::Ok(OkPayload { data: Some(data) })
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Converts a dispatch result into a response.
    #[must_use]
    pub fn from_result(result: crate::Result<Reply>) -> Self {
        match result {
            Ok(Reply::Done) => Self::ok(),
            Ok(reply) => match serde_json::to_value(&reply) {
                Ok(data) => Self::ok_with_data(data),
                Err(e) => Self::error(ErrorCode::Internal, format!("encode reply: {e}")),
            },
            Err(e) => Self::error(ErrorCode::from(&e), e.to_string()),
        }
    }

    /// Returns true if this is a success response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Error code, if this is an error response.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Ok(_) => None,
            Self::Error(payload) => Some(payload.code),
        }
    }

    /// Reply data, if any.
    #[must_use]
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Ok(payload) => payload.data.as_ref(),
            Self::Error(_) => None,
        }
    }
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Request {
    /// Serializes request to JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes request from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

impl Response {
    /// Serializes response to JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes response from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerStatus, Operation};

    #[test]
    fn test_done_has_no_data() {
        let resp = Response::from_result(Ok(Reply::Done));
        let json = resp.to_json_line().unwrap();
        assert_eq!(json, "{\"status\":\"ok\"}\n");
    }

    #[test]
    fn test_started_reply_data() {
        let resp = Response::from_result(Ok(Reply::Started { pid: 42 }));
        assert_eq!(resp.data().unwrap()["pid"], 42);
    }

    #[test]
    fn test_error_mapping() {
        let resp = Response::from_result(Err(Error::invalid_state(
            Operation::Start,
            ContainerStatus::Running,
        )));
        let json = resp.to_json_line().unwrap();
        assert!(json.contains("\"code\":\"invalid_state\""));
        assert!(json.contains("cannot start container in state 'running'"));
    }
}
