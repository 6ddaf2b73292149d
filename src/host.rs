//! Local implementations of the sandbox capabilities.
//!
//! These run the gateway directly on the host: processes are spawned
//! through `sh -c` with captured output, probes go over loopback TCP and
//! HTTP, and storage mounting is either a no-op or a shell command. A
//! production deployment substitutes the platform's own implementations
//! of the traits in [`crate::capabilities`]; this module keeps the
//! supervisor fully runnable without one.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capabilities::{
    FetchResponse, ProcessHost, ProcessLogs, ProcessStatus, SandboxFetch, SandboxProcess,
    StorageMount,
};
use crate::error::CapabilityError;

/// Interval between TCP probes while waiting for a port to open.
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Bound on one TCP connect attempt.
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a kill waits for the process to be reaped before reporting
/// failure.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Cap on each captured output stream. Older output is dropped first.
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// Default bound on the storage mount command.
const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// LocalProcess
// ---------------------------------------------------------------------------

/// One host process spawned through `sh -c` in its own process group,
/// with its output captured into bounded in-memory buffers.
pub struct LocalProcess {
    id: String,
    command: String,
    /// Process group id, equal to the shell's pid. Kills signal the
    /// whole group because a compound command runs the gateway as a
    /// grandchild of the shell.
    pgid: Option<u32>,
    exited: Arc<AtomicBool>,
    kill_signal: Arc<Notify>,
    stdout: Arc<RwLock<String>>,
    stderr: Arc<RwLock<String>>,
}

impl LocalProcess {
    fn spawn(command: &str, env: &HashMap<String, String>) -> Result<Arc<Self>, CapabilityError> {
        let mut builder = Command::new("sh");
        builder
            .args(["-c", command])
            .envs(env)
            // Own process group, so one signal reaches the shell and
            // everything it spawned.
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = builder.spawn().map_err(|spawn_error| CapabilityError::Spawn {
            reason: spawn_error.to_string(),
        })?;

        let process = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            pgid: child.id(),
            exited: Arc::new(AtomicBool::new(false)),
            kill_signal: Arc::new(Notify::new()),
            stdout: Arc::new(RwLock::new(String::new())),
            stderr: Arc::new(RwLock::new(String::new())),
        });

        if let Some(stdout) = child.stdout.take() {
            let buffer = Arc::clone(&process.stdout);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    append_capped(&buffer, &line).await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let buffer = Arc::clone(&process.stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    append_capped(&buffer, &line).await;
                }
            });
        }

        // Single owner of the child handle: reaps on natural exit or on a
        // kill request, then flips the exit flag exactly once.
        let exited = Arc::clone(&process.exited);
        let kill_signal = Arc::clone(&process.kill_signal);
        let id = process.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                exit = child.wait() => match exit {
                    Ok(status) => debug!("Process {id} exited with {status}"),
                    Err(wait_error) => warn!(%wait_error, "Failed to reap process {id}"),
                },
                _ = kill_signal.notified() => {
                    if let Err(kill_error) = child.start_kill() {
                        warn!(%kill_error, "Failed to signal process {id}");
                    }
                    let _ = child.wait().await;
                    debug!("Process {id} killed");
                }
            }
            exited.store(true, Ordering::SeqCst);
        });

        Ok(process)
    }
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ProcessStatus {
        if self.exited.load(Ordering::SeqCst) {
            ProcessStatus::Exited
        } else {
            ProcessStatus::Running
        }
    }

    async fn kill(&self) -> Result<(), CapabilityError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        // With a compound start command the gateway runs as a grandchild
        // of the tracked shell. Signal the whole group; reaping just the
        // shell would leave the grandchild alive and the port held.
        if let Some(pgid) = self.pgid {
            let script = format!("kill -9 -- -{pgid}");
            let mut group_kill = Command::new("sh");
            group_kill
                .args(["-c", script.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match group_kill.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!("Group kill for process {} exited with {status}", self.id);
                }
                Err(kill_error) => {
                    warn!(%kill_error, "Group kill for process {} failed", self.id);
                }
            }
        }
        self.kill_signal.notify_one();

        // SIGKILL lands promptly but reaping is asynchronous; confirm
        // within a bound so callers never hang on a wedged process.
        let deadline = tokio::time::Instant::now() + KILL_CONFIRM_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }
        Err(CapabilityError::KillFailed {
            id: self.id.clone(),
            reason: format!("still running {KILL_CONFIRM_TIMEOUT:?} after kill signal"),
        })
    }

    async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<(), CapabilityError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // A dead process will never open the port; fail fast with the
            // more specific error.
            if self.exited.load(Ordering::SeqCst) {
                return Err(CapabilityError::ExitedEarly { port });
            }
            if port_accepts(port).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CapabilityError::PortWaitTimeout { port, timeout });
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }

    async fn logs(&self) -> Result<ProcessLogs, CapabilityError> {
        Ok(ProcessLogs {
            stdout: self.stdout.read().await.clone(),
            stderr: self.stderr.read().await.clone(),
        })
    }
}

async fn port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Append one line to a capture buffer, dropping the oldest output once
/// the cap is exceeded.
async fn append_capped(buffer: &RwLock<String>, line: &str) {
    let mut guard = buffer.write().await;
    guard.push_str(line);
    guard.push('\n');
    if guard.len() > MAX_CAPTURED_BYTES {
        let mut cut = guard.len() - MAX_CAPTURED_BYTES;
        while !guard.is_char_boundary(cut) {
            cut += 1;
        }
        guard.drain(..cut);
    }
}

// ---------------------------------------------------------------------------
// LocalProcessHost
// ---------------------------------------------------------------------------

/// Spawns and tracks host processes.
///
/// The registry keeps every spawned process, exited ones included, so
/// listings mirror what a platform process table would show shortly
/// after a crash.
#[derive(Default)]
pub struct LocalProcessHost {
    registry: RwLock<Vec<Arc<LocalProcess>>>,
}

impl LocalProcessHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessHost for LocalProcessHost {
    async fn start(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn SandboxProcess>, CapabilityError> {
        let process = LocalProcess::spawn(command, env)?;
        debug!("Spawned process {} for: {command}", process.id);
        self.registry.write().await.push(Arc::clone(&process));
        Ok(process)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<i64, CapabilityError> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).stdin(Stdio::null());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| CapabilityError::ExecTimeout { timeout })?
            .map_err(|spawn_error| CapabilityError::Spawn {
                reason: spawn_error.to_string(),
            })?;
        Ok(i64::from(output.status.code().unwrap_or(-1)))
    }

    async fn list(&self) -> Result<Vec<Arc<dyn SandboxProcess>>, CapabilityError> {
        let registry = self.registry.read().await;
        Ok(registry
            .iter()
            .map(|process| Arc::clone(process) as Arc<dyn SandboxProcess>)
            .collect())
    }

    async fn find_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<Arc<dyn SandboxProcess>>, CapabilityError> {
        let registry = self.registry.read().await;
        // Newest first: after a crash loop the latest spawn is the one
        // worth adopting.
        Ok(registry
            .iter()
            .rev()
            .find(|process| {
                process.command.contains(signature) && process.status().is_alive()
            })
            .map(|process| Arc::clone(process) as Arc<dyn SandboxProcess>))
    }

    async fn remove_file(&self, path: &str) -> Result<(), CapabilityError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(io_error) if io_error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(io_error) => Err(CapabilityError::Io(io_error)),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalFetch
// ---------------------------------------------------------------------------

/// Loopback HTTP fetch with a shared client.
pub struct LocalFetch {
    client: reqwest::Client,
}

impl Default for LocalFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SandboxFetch for LocalFetch {
    async fn fetch(
        &self,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<FetchResponse, CapabilityError> {
        let url = format!("http://127.0.0.1:{}/{}", port, path.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|fetch_error| CapabilityError::FetchFailed {
                port,
                reason: fetch_error.to_string(),
            })?;
        Ok(FetchResponse {
            status: response.status().as_u16(),
        })
    }
}

// ---------------------------------------------------------------------------
// Storage mounts
// ---------------------------------------------------------------------------

/// No-op mount for hosts where the gateway data directory already exists.
pub struct NoopMount;

#[async_trait]
impl StorageMount for NoopMount {
    async fn mount(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Runs a configurable mount command through the process host. The
/// command itself must be idempotent; it runs before every fresh start.
pub struct CommandMount {
    host: Arc<dyn ProcessHost>,
    command: String,
    timeout: Duration,
}

impl CommandMount {
    pub fn new(host: Arc<dyn ProcessHost>, command: impl Into<String>) -> Self {
        Self {
            host,
            command: command.into(),
            timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StorageMount for CommandMount {
    async fn mount(&self) -> Result<(), CapabilityError> {
        let code = self.host.exec(&self.command, self.timeout).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(CapabilityError::MountFailed {
                reason: format!("mount command exited with code {code}"),
            })
        }
    }
}
