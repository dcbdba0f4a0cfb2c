//! Error taxonomy for gateway calls and the recreate-update protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single control-plane call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("subscription closed")]
    Closed,
}

impl GatewayError {
    pub fn api(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Api { code, reason: reason.into(), message: message.into() }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            GatewayError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool { self.code() == Some(404) }
    pub fn is_conflict(&self) -> bool { self.code() == Some(409) }
}

/// Where the live object stands after a failed protocol run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ObjectState {
    /// Nothing destructive happened; the caller may retry freely.
    Untouched,
    /// Delete was issued (or may have been); the object can be present or terminating.
    MayExist,
    /// The previous object is gone and the replacement was not created.
    Absent,
}

/// Failure of a recreate-update or delete-and-await run, tagged by protocol stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("invalid request: {0}")]
    Mismatch(String),
    #[error("inspect failed: {0}")]
    Inspect(#[source] GatewayError),
    #[error("validation rejected: {0}")]
    Validation(#[source] GatewayError),
    #[error("create failed: {0}")]
    Create(#[source] GatewayError),
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] GatewayError),
    #[error("delete failed: {0}")]
    Delete(#[source] GatewayError),
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("recreate failed, object is now absent: {0}")]
    Recreate(#[source] GatewayError),
}

impl UpdateError {
    pub fn object_state(&self) -> ObjectState {
        match self {
            UpdateError::Mismatch(_)
            | UpdateError::Inspect(_)
            | UpdateError::Validation(_)
            | UpdateError::Create(_)
            | UpdateError::Subscribe(_) => ObjectState::Untouched,
            UpdateError::Delete(_) | UpdateError::Subscription(_) => ObjectState::MayExist,
            UpdateError::Recreate(_) => ObjectState::Absent,
        }
    }

    /// The gateway error behind this failure, if there is one.
    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            UpdateError::Inspect(e)
            | UpdateError::Validation(e)
            | UpdateError::Create(e)
            | UpdateError::Subscribe(e)
            | UpdateError::Delete(e)
            | UpdateError::Recreate(e) => Some(e),
            UpdateError::Mismatch(_) | UpdateError::Subscription(_) => None,
        }
    }
}

/// A dependent that could not be removed. Reported, never escalated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sweep {namespace}/{name}: {source}")]
pub struct SweepError {
    pub namespace: String,
    pub name: String,
    #[source]
    pub source: GatewayError,
}
