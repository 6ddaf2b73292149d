//! Capability traits for the sandboxed execution environment.
//!
//! The supervisor never talks to a platform API directly. Everything it
//! needs from the outside world comes through these traits, so the same
//! lifecycle logic can drive a real sandbox, plain host processes (see
//! [`crate::host`]), or scripted stubs (see [`crate::testing`]).
//!
//! ```text
//!                 +------------------+
//!                 | LifecycleEngine  |
//!                 +--------+---------+
//!                          |
//!        +---------+-------+--------+----------+
//!        |         |                |          |
//!   ProcessHost  SandboxProcess  SandboxFetch  StorageMount
//!   (spawn/exec) (kill/wait)     (port probes) (mount)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CapabilityError;

/// Lifecycle status of a sandbox process, as observed when the handle was
/// obtained from a listing. Handles do not self-refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Created but not yet confirmed running.
    Starting,
    /// Alive as of the last observation.
    Running,
    /// Terminated.
    Exited,
    /// The platform reported something unrecognized.
    Unknown,
}

impl ProcessStatus {
    /// Whether the process is worth waiting on or killing.
    pub fn is_alive(&self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

/// Captured output of a sandbox process.
#[derive(Debug, Clone, Default)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Status line of a sandbox-scoped fetch. Bodies never leave the
/// capability; the supervisor only reasons about status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
}

impl FetchResponse {
    /// Whether the response is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Handle to one process inside the sandbox.
#[async_trait]
pub trait SandboxProcess: Send + Sync {
    /// Opaque identifier, stable for the lifetime of the process.
    fn id(&self) -> &str;

    /// Status as observed when this handle was obtained.
    fn status(&self) -> ProcessStatus;

    /// Forcibly terminate the process.
    async fn kill(&self) -> std::result::Result<(), CapabilityError>;

    /// Wait until the process accepts connections on `port`, up to
    /// `timeout`. Fails early if the process exits first.
    async fn wait_for_port(
        &self,
        port: u16,
        timeout: Duration,
    ) -> std::result::Result<(), CapabilityError>;

    /// Captured stdout and stderr so far.
    async fn logs(&self) -> std::result::Result<ProcessLogs, CapabilityError>;
}

/// Process-level operations of the sandbox.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Start a long-running process with the given environment and return
    /// a handle to it.
    async fn start(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> std::result::Result<Arc<dyn SandboxProcess>, CapabilityError>;

    /// Run a short-lived command to completion within `timeout` and return
    /// its exit code.
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<i64, CapabilityError>;

    /// List all known processes, including recently exited ones.
    async fn list(&self) -> std::result::Result<Vec<Arc<dyn SandboxProcess>>, CapabilityError>;

    /// Find a live process whose command line contains `signature`.
    async fn find_by_signature(
        &self,
        signature: &str,
    ) -> std::result::Result<Option<Arc<dyn SandboxProcess>>, CapabilityError>;

    /// Remove a file from the sandbox filesystem. A missing file is not an
    /// error.
    async fn remove_file(&self, path: &str) -> std::result::Result<(), CapabilityError>;
}

/// HTTP fetch against a local port inside the sandbox.
#[async_trait]
pub trait SandboxFetch: Send + Sync {
    /// Issue a GET to `path` on `127.0.0.1:{port}`, bounded by `timeout`.
    /// Any response, regardless of status, resolves `Ok`; connection
    /// refusal and timeouts are errors.
    async fn fetch(
        &self,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> std::result::Result<FetchResponse, CapabilityError>;
}

/// Backing storage for the gateway's persistent data.
#[async_trait]
pub trait StorageMount: Send + Sync {
    /// Mount the storage. Idempotent; calling with storage already mounted
    /// must succeed.
    async fn mount(&self) -> std::result::Result<(), CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_statuses() {
        assert!(ProcessStatus::Starting.is_alive());
        assert!(ProcessStatus::Running.is_alive());
        assert!(!ProcessStatus::Exited.is_alive());
        assert!(!ProcessStatus::Unknown.is_alive());
    }

    #[test]
    fn server_error_band() {
        assert!(!FetchResponse { status: 200 }.is_server_error());
        assert!(!FetchResponse { status: 404 }.is_server_error());
        assert!(!FetchResponse { status: 499 }.is_server_error());
        assert!(FetchResponse { status: 500 }.is_server_error());
        assert!(FetchResponse { status: 503 }.is_server_error());
        assert!(FetchResponse { status: 599 }.is_server_error());
        assert!(!FetchResponse { status: 600 }.is_server_error());
    }
}
