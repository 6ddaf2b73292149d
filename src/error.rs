//! Error types for gateway supervision.
//!
//! Only failures that leave the gateway unusable cross the supervisor
//! boundary. Probe failures are ordinary "not healthy" answers and
//! best-effort cleanup failures are logged and absorbed, so neither
//! appears here.

use std::time::Duration;

use thiserror::Error;

/// Result alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Fatal lifecycle failures surfaced to callers of the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The gateway process was spawned but never opened its service port.
    /// `diagnostics` carries the tail of captured stderr when available.
    #[error("gateway did not open port {port} within {timeout:?}: {diagnostics}")]
    StartupTimeout {
        port: u16,
        timeout: Duration,
        diagnostics: String,
    },

    /// The gateway process could not be spawned at all.
    #[error("failed to start gateway process: {reason}")]
    SpawnFailed { reason: String },

    /// Backing storage could not be mounted before a fresh start.
    #[error("failed to mount gateway storage: {reason}")]
    MountFailed { reason: String },
}

/// Failures raised by the sandbox capability implementations.
///
/// These never escape the lifecycle engine directly; the engine decides
/// per call site whether a failure is fatal, a retry, or a logged shrug.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// A process could not be spawned.
    #[error("failed to spawn process: {reason}")]
    Spawn { reason: String },

    /// The process exited before its port ever opened.
    #[error("process exited before opening port {port}")]
    ExitedEarly { port: u16 },

    /// The port never opened within the allotted window.
    #[error("port {port} did not open within {timeout:?}")]
    PortWaitTimeout { port: u16, timeout: Duration },

    /// A kill request failed or could not be confirmed.
    #[error("failed to kill process '{id}': {reason}")]
    KillFailed { id: String, reason: String },

    /// Captured process output could not be read.
    #[error("process logs unavailable: {reason}")]
    LogsUnavailable { reason: String },

    /// The process listing could not be obtained.
    #[error("process listing failed: {reason}")]
    ListFailed { reason: String },

    /// A loopback fetch did not produce a response.
    #[error("fetch to port {port} failed: {reason}")]
    FetchFailed { port: u16, reason: String },

    /// A short-lived command did not finish in time.
    #[error("command did not finish within {timeout:?}")]
    ExecTimeout { timeout: Duration },

    /// The storage mount command ran and reported failure.
    #[error("mount failed: {reason}")]
    MountFailed { reason: String },

    /// Filesystem-level failure inside the sandbox.
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration resolution failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was set to something unparseable.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// An environment variable exists but is not valid unicode.
    #[error("environment variable {key} is not valid unicode")]
    NotUnicode { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_timeout_message_includes_diagnostics() {
        let err = SupervisorError::StartupTimeout {
            port: 18789,
            timeout: Duration::from_secs(30),
            diagnostics: "boot error: disk full".to_string(),
        };
        let message = err.to_string();
        assert!(
            message.contains("18789"),
            "message should name the port: {message}"
        );
        assert!(
            message.contains("boot error: disk full"),
            "message should carry the stderr tail: {message}"
        );
    }

    #[test]
    fn capability_errors_render_context() {
        let err = CapabilityError::KillFailed {
            id: "proc-1".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to kill process 'proc-1': permission denied"
        );

        let err = CapabilityError::PortWaitTimeout {
            port: 18789,
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("did not open"));
    }
}
