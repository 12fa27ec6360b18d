//! Error taxonomy for the EdgeLink SDK
//!
//! - Setup errors: invalid configuration or missing preconditions, never retried
//! - Transport errors: directory unreachable, retried once on the wifi path
//! - Protocol/status errors: non-success directory statuses, server error events
//! - Host-facing failures: what `on_connection_failure` receives

use crate::directory::DirectoryStatus;
use serde::Serialize;
use std::fmt;

/// Invalid configuration or missing session preconditions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SetupError {
    #[error("latency threshold must be > 0 ms (got {0})")]
    InvalidLatencyThreshold(f64),
    #[error("performance switch margin must be within [0, 1] (got {0})")]
    InvalidSwitchMargin(f64),
    #[error("{0} update interval must be > 0 seconds for OnInterval")]
    InvalidUpdateInterval(&'static str),
    #[error("samples per latency test must be at least 1")]
    InvalidSamplesPerTest,
    #[error("no FindCloudlet event triggers enabled")]
    MissingTriggers,
    #[error("{0} is not set; register and find a cloudlet first")]
    MissingCookie(&'static str),
    #[error("host callback {0} is required before starting edge events")]
    MissingCallback(&'static str),
    #[error("no current cloudlet in the session registry")]
    NoCurrentCloudlet,
    #[error("edge events already started")]
    AlreadyStarted,
}

/// Failure talking to the directory service
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("directory returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid directory reply: {0}")]
    Decode(String),
}

impl DirectoryError {
    /// Whether the wifi fallback path should be tried.
    pub fn is_transient(&self) -> bool {
        matches!(self, DirectoryError::Unreachable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegisterFailure {
    #[error("registration rejected with status {0:?}")]
    Rejected(DirectoryStatus),
    #[error("registration reply carried no session cookie")]
    MissingCookie,
    #[error("registration transport error: {0}")]
    Transport(DirectoryError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FindCloudletFailure {
    #[error("FindCloudlet requires a successful registration")]
    NotRegistered,
    #[error("no cloudlet found for this application")]
    NotFound,
    #[error("directory returned status {0:?}")]
    UnknownStatus(DirectoryStatus),
    #[error("no application instances in region")]
    NoAppInstances,
    #[error("no candidate cloudlet answered the latency test")]
    NoReachableCandidate,
    #[error("FindCloudlet transport error: {0}")]
    Transport(DirectoryError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolverError {
    #[error(transparent)]
    Register(#[from] RegisterFailure),
    #[error(transparent)]
    FindCloudlet(#[from] FindCloudletFailure),
}

/// Connect or ping test failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe to {0} timed out")]
    Timeout(String),
    #[error("probe io error: {0}")]
    Io(String),
    #[error("could not parse ping output")]
    Unparseable,
    #[error("cloudlet exposes no port usable for latency tests")]
    NoTestPort,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("edge events setup error: {0}")]
    Setup(#[from] SetupError),
    #[error("edge events channel is not open")]
    NotOpen,
    #[error("edge events transport error: {0}")]
    Transport(String),
    #[error("failed to encode client event: {0}")]
    Encode(String),
    #[error("latency test failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Classification of what the host's failure callback receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    // Hard failures
    SetupFailed,
    ServerError,
    FindCloudletFailed,
    LatencyTestFailed,
    ChannelFailed,
    MigrationReopenFailed,
    // Evaluation skips: expected steady-state outcomes
    CurrentCloudletIsBest,
    NoReplacementCloudlet,
}

impl FailureReason {
    pub fn is_hard_failure(&self) -> bool {
        !matches!(
            self,
            FailureReason::CurrentCloudletIsBest | FailureReason::NoReplacementCloudlet
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::SetupFailed => "setup failed",
            FailureReason::ServerError => "server error",
            FailureReason::FindCloudletFailed => "find cloudlet failed",
            FailureReason::LatencyTestFailed => "latency test failed",
            FailureReason::ChannelFailed => "edge events channel failed",
            FailureReason::MigrationReopenFailed => "migration reopen failed",
            FailureReason::CurrentCloudletIsBest => "current cloudlet is best",
            FailureReason::NoReplacementCloudlet => "trigger fired without replacement",
        };
        f.write_str(text)
    }
}

/// Payload of `on_connection_failure`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeEventsFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl EdgeEventsFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

impl fmt::Display for EdgeEventsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reasons_are_not_hard_failures() {
        assert!(!FailureReason::CurrentCloudletIsBest.is_hard_failure());
        assert!(!FailureReason::NoReplacementCloudlet.is_hard_failure());
        assert!(FailureReason::MigrationReopenFailed.is_hard_failure());
        assert!(FailureReason::ServerError.is_hard_failure());
    }

    #[test]
    fn test_transient_directory_errors() {
        let unreachable = DirectoryError::Unreachable { host: "310-260.dme.example.net".into(), reason: "dns".into() };
        assert!(unreachable.is_transient());
        assert!(!DirectoryError::Http { status: 400, body: String::new() }.is_transient());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(FailureReason::CurrentCloudletIsBest.to_string(), "current cloudlet is best");
    }
}
