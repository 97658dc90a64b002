//! Error types for the storage control sync core
//!
//! Errors fall into four families with different handling: negotiation
//! failures close the session and are retried by the peer, invariant
//! violations always end on a fatal path, transient delivery failures go to
//! the retry supervisor, and stale data is dropped.

use std::time::Duration;
use thiserror::Error;

use crate::model::{LockMode, LockObj};

/// Unified error type for the sync core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Negotiation Errors
    // =========================================================================
    #[error("Hostname mismatch: peer declared {declared}, expected {expected}")]
    HostnameMismatch { declared: String, expected: String },

    #[error("Authentication failed for {node}: {reason}")]
    AuthenticationFailed { node: String, reason: String },

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    // =========================================================================
    // Invariant Violations
    // =========================================================================
    #[error("Duplicate update sequence {sequence} in epoch {epoch}")]
    DuplicateSequence { epoch: u64, sequence: u64 },

    #[error("Fingerprint mismatch for {kind} {name}: local {local}, received {received}")]
    FingerprintMismatch {
        kind: String,
        name: String,
        local: String,
        received: String,
    },

    #[error("Shared pool lock contract violated: {0}")]
    LockContractViolation(String),

    #[error("Lock {lock} is not held in {mode} mode")]
    LockNotHeld { lock: LockObj, mode: LockMode },

    #[error("Implementation error: {0}")]
    Implementation(String),

    // =========================================================================
    // Transient Delivery Errors
    // =========================================================================
    #[error("Peer not connected: {node}")]
    PeerNotConnected { node: String },

    #[error("Send to {node} failed: {reason}")]
    SendFailed { node: String, reason: String },

    #[error("Call to {node} timed out after {after:?}")]
    CallTimeout { node: String, after: Duration },

    #[error("Connecting to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("Full sync failed on {node}")]
    FullSyncFailed { node: String },

    // =========================================================================
    // Stale Data
    // =========================================================================
    #[error("Stale epoch {received}, current epoch is {current}")]
    StaleEpoch { received: u64, current: u64 },

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("Entity not found: {kind}/{name}")]
    EntityNotFound { kind: String, name: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // =========================================================================
    // Conversions
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the layer that detected an error should do about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a fixed delay
    RetryAfter(Duration),
    /// Drop the session; the peer redials and re-authenticates
    CloseAndReconnect,
    /// Ignore the message
    Discard,
    /// Escalate to process shutdown
    Fatal,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::PeerNotConnected { .. }
            | Error::SendFailed { .. }
            | Error::ConnectTimeout { .. }
            | Error::Io(_) => ErrorAction::RetryWithBackoff,

            Error::CallTimeout { .. } => ErrorAction::RetryAfter(Duration::from_secs(10)),

            Error::HostnameMismatch { .. }
            | Error::AuthenticationFailed { .. }
            | Error::VersionMismatch { .. }
            | Error::FullSyncFailed { .. } => ErrorAction::CloseAndReconnect,

            Error::StaleEpoch { .. } => ErrorAction::Discard,

            Error::DuplicateSequence { .. }
            | Error::FingerprintMismatch { .. }
            | Error::LockContractViolation(_)
            | Error::LockNotHeld { .. }
            | Error::Implementation(_) => ErrorAction::Fatal,

            // Payload problems end the current sync cycle
            Error::InvalidPayload(_) | Error::EntityNotFound { .. } | Error::Json(_) => {
                ErrorAction::CloseAndReconnect
            }

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Yaml(_)
            | Error::AddrParse(_) => ErrorAction::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::RetryWithBackoff | ErrorAction::RetryAfter(_)
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PeerNotConnected { .. }
                | Error::SendFailed { .. }
                | Error::CallTimeout { .. }
                | Error::ConnectTimeout { .. }
        )
    }

    /// Invariant violations and unusable configuration
    pub fn is_fatal(&self) -> bool {
        matches!(self.action(), ErrorAction::Fatal)
    }
}

/// Result type alias for the sync core
pub type Result<T> = std::result::Result<T, Error>;
