//! Test harness and scripted capability stubs.
//!
//! Provides:
//! - [`StubFetch`], [`StubProcess`], [`StubHost`], [`StubMount`]:
//!   scripted stand-ins for the sandbox capabilities
//! - [`TestHarnessBuilder`]: wires a supervisor to the stubs
//! - [`TestHarness`]: the assembled pieces, with handles kept for
//!   call-count assertions
//!
//! Each stub counts its calls so tests can assert not just the outcome
//! of a lifecycle operation but the path taken to it.
//!
//! # Usage
//!
//! ```rust,no_run
//! use gateward::testing::TestHarnessBuilder;
//!
//! # async fn demo() {
//! let harness = TestHarnessBuilder::new().build();
//! let snapshot = harness.supervisor.ensure().await;
//! # let _ = snapshot;
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::capabilities::{
    FetchResponse, ProcessHost, ProcessLogs, ProcessStatus, SandboxFetch, SandboxProcess,
    StorageMount,
};
use crate::config::GatewayConfig;
use crate::engine::LifecycleEngine;
use crate::error::CapabilityError;
use crate::supervisor::GatewaySupervisor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeScript {
    /// Respond with this HTTP status.
    Status(u16),
    /// Simulate nothing listening on the port.
    Refused,
}

// ---------------------------------------------------------------------------
// StubFetch
// ---------------------------------------------------------------------------

/// Scripted [`SandboxFetch`] with concurrency instrumentation.
///
/// Pops one scripted outcome per call, falling back to a default once the
/// script runs dry. `max_concurrent` records how many fetches ever
/// overlapped, which is how serialization tests catch engine overlap.
pub struct StubFetch {
    script: Mutex<VecDeque<ProbeScript>>,
    default: ProbeScript,
    delay: Duration,
    calls: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
}

impl StubFetch {
    /// Every probe is refused, as if the port were closed.
    pub fn refusing() -> Self {
        Self::always(ProbeScript::Refused)
    }

    /// Every probe answers 200, as if a healthy gateway were up.
    pub fn healthy() -> Self {
        Self::always(ProbeScript::Status(200))
    }

    /// Every probe yields the same outcome.
    pub fn always(outcome: ProbeScript) -> Self {
        Self::scripted(Vec::new(), outcome)
    }

    /// Play `script` in order, then fall back to `default`.
    pub fn scripted(script: Vec<ProbeScript>, default: ProbeScript) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
        }
    }

    /// Hold each probe open for `delay`, widening the window in which an
    /// overlapping caller would be caught.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Total probes issued.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of probes ever in flight at once.
    pub fn max_concurrent(&self) -> u32 {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxFetch for StubFetch {
    async fn fetch(
        &self,
        port: u16,
        _path: &str,
        _timeout: Duration,
    ) -> Result<FetchResponse, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(in_flight, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let outcome = lock(&self.script).pop_front().unwrap_or(self.default);
        match outcome {
            ProbeScript::Status(status) => Ok(FetchResponse { status }),
            ProbeScript::Refused => Err(CapabilityError::FetchFailed {
                port,
                reason: "connection refused".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// StubProcess
// ---------------------------------------------------------------------------

const STATUS_STARTING: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_EXITED: u8 = 2;

fn decode_status(raw: u8) -> ProcessStatus {
    match raw {
        STATUS_STARTING => ProcessStatus::Starting,
        STATUS_RUNNING => ProcessStatus::Running,
        _ => ProcessStatus::Exited,
    }
}

/// Scripted [`SandboxProcess`].
///
/// Port waits resolve instantly with a fixed outcome, and kills flip the
/// status to exited unless told to fail.
pub struct StubProcess {
    id: String,
    status: AtomicU8,
    port_opens: bool,
    kill_fails: AtomicBool,
    logs: ProcessLogs,
    kill_calls: AtomicU32,
    port_wait_calls: AtomicU32,
}

impl StubProcess {
    /// A running process whose port wait succeeds.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AtomicU8::new(STATUS_RUNNING),
            port_opens: true,
            kill_fails: AtomicBool::new(false),
            logs: ProcessLogs::default(),
            kill_calls: AtomicU32::new(0),
            port_wait_calls: AtomicU32::new(0),
        }
    }

    /// A process the platform still reports as starting.
    pub fn starting(id: impl Into<String>) -> Self {
        let process = Self::new(id);
        process.status.store(STATUS_STARTING, Ordering::SeqCst);
        process
    }

    /// Port waits fail with a timeout instead of succeeding.
    pub fn with_port_wait_timeout(mut self) -> Self {
        self.port_opens = false;
        self
    }

    /// Kill requests fail and leave the process running.
    pub fn with_kill_failure(self) -> Self {
        self.kill_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Captured output returned by `logs()`.
    pub fn with_logs(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.logs = ProcessLogs {
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self
    }

    pub fn kill_calls(&self) -> u32 {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn port_wait_calls(&self) -> u32 {
        self.port_wait_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProcess for StubProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ProcessStatus {
        decode_status(self.status.load(Ordering::SeqCst))
    }

    async fn kill(&self) -> Result<(), CapabilityError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        if self.kill_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::KillFailed {
                id: self.id.clone(),
                reason: "kill refused by platform".to_string(),
            });
        }
        self.status.store(STATUS_EXITED, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<(), CapabilityError> {
        self.port_wait_calls.fetch_add(1, Ordering::SeqCst);
        if self.status() == ProcessStatus::Exited {
            return Err(CapabilityError::ExitedEarly { port });
        }
        if self.port_opens {
            self.status.store(STATUS_RUNNING, Ordering::SeqCst);
            Ok(())
        } else {
            Err(CapabilityError::PortWaitTimeout { port, timeout })
        }
    }

    async fn logs(&self) -> Result<ProcessLogs, CapabilityError> {
        Ok(self.logs.clone())
    }
}

// ---------------------------------------------------------------------------
// StubHost
// ---------------------------------------------------------------------------

/// Scripted [`ProcessHost`].
///
/// `find_by_signature` pops from a script where an exhausted script means
/// "not found"; `start` pops prepared processes or fabricates fresh ones.
/// Every handle this host gives out shows up in later `list()` calls,
/// matching how a real listing sees what was spawned.
pub struct StubHost {
    find_queue: Mutex<VecDeque<Option<Arc<StubProcess>>>>,
    start_queue: Mutex<VecDeque<Arc<StubProcess>>>,
    known: Mutex<Vec<Arc<StubProcess>>>,
    started_commands: Mutex<Vec<String>>,
    started_envs: Mutex<Vec<HashMap<String, String>>>,
    exec_commands: Mutex<Vec<String>>,
    removed_files: Mutex<Vec<String>>,
    start_fails: AtomicBool,
    exec_fails: AtomicBool,
    remove_fails: AtomicBool,
    exec_exit_code: AtomicI64,
    auto_id: AtomicU32,
    start_calls: AtomicU32,
    exec_calls: AtomicU32,
    list_calls: AtomicU32,
    find_calls: AtomicU32,
}

impl Default for StubHost {
    fn default() -> Self {
        Self::new()
    }
}

impl StubHost {
    pub fn new() -> Self {
        Self {
            find_queue: Mutex::new(VecDeque::new()),
            start_queue: Mutex::new(VecDeque::new()),
            known: Mutex::new(Vec::new()),
            started_commands: Mutex::new(Vec::new()),
            started_envs: Mutex::new(Vec::new()),
            exec_commands: Mutex::new(Vec::new()),
            removed_files: Mutex::new(Vec::new()),
            start_fails: AtomicBool::new(false),
            exec_fails: AtomicBool::new(false),
            remove_fails: AtomicBool::new(false),
            exec_exit_code: AtomicI64::new(0),
            auto_id: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            exec_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            find_calls: AtomicU32::new(0),
        }
    }

    /// Queue the next `find_by_signature` answer.
    pub fn push_find(&self, result: Option<Arc<StubProcess>>) {
        lock(&self.find_queue).push_back(result);
    }

    /// Queue the process the next `start()` returns.
    pub fn push_start(&self, process: Arc<StubProcess>) {
        lock(&self.start_queue).push_back(process);
    }

    /// Make every `start()` fail at spawn time.
    pub fn fail_starts(&self) {
        self.start_fails.store(true, Ordering::SeqCst);
    }

    /// Make every `exec()` time out.
    pub fn fail_execs(&self) {
        self.exec_fails.store(true, Ordering::SeqCst);
    }

    /// Make every `remove_file()` fail.
    pub fn fail_removes(&self) {
        self.remove_fails.store(true, Ordering::SeqCst);
    }

    /// Exit code reported by successful `exec()` calls.
    pub fn set_exec_exit_code(&self, code: i64) {
        self.exec_exit_code.store(code, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> u32 {
        self.exec_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> u32 {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Commands passed to `start()`, in order.
    pub fn started_commands(&self) -> Vec<String> {
        lock(&self.started_commands).clone()
    }

    /// Environment passed to the most recent `start()`.
    pub fn last_start_env(&self) -> Option<HashMap<String, String>> {
        lock(&self.started_envs).last().cloned()
    }

    /// Commands passed to `exec()`, in order.
    pub fn exec_commands(&self) -> Vec<String> {
        lock(&self.exec_commands).clone()
    }

    /// Paths handed to `remove_file()`, in order, including failed ones.
    pub fn removed_files(&self) -> Vec<String> {
        lock(&self.removed_files).clone()
    }

    /// Every process this host has handed out so far.
    pub fn spawned(&self) -> Vec<Arc<StubProcess>> {
        lock(&self.known).clone()
    }

    fn register(&self, process: &Arc<StubProcess>) {
        let mut known = lock(&self.known);
        if !known.iter().any(|existing| existing.id == process.id) {
            known.push(Arc::clone(process));
        }
    }
}

#[async_trait]
impl ProcessHost for StubHost {
    async fn start(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn SandboxProcess>, CapabilityError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.started_commands).push(command.to_string());
        lock(&self.started_envs).push(env.clone());

        if self.start_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::Spawn {
                reason: "sandbox rejected spawn".to_string(),
            });
        }

        let process = match lock(&self.start_queue).pop_front() {
            Some(prepared) => prepared,
            None => {
                let n = self.auto_id.fetch_add(1, Ordering::SeqCst) + 1;
                Arc::new(StubProcess::new(format!("stub-proc-{n}")))
            }
        };
        self.register(&process);
        Ok(process)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<i64, CapabilityError> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.exec_commands).push(command.to_string());
        if self.exec_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::ExecTimeout { timeout });
        }
        Ok(self.exec_exit_code.load(Ordering::SeqCst))
    }

    async fn list(&self) -> Result<Vec<Arc<dyn SandboxProcess>>, CapabilityError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let known = lock(&self.known);
        Ok(known
            .iter()
            .map(|process| Arc::clone(process) as Arc<dyn SandboxProcess>)
            .collect())
    }

    async fn find_by_signature(
        &self,
        _signature: &str,
    ) -> Result<Option<Arc<dyn SandboxProcess>>, CapabilityError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.find_queue).pop_front() {
            Some(Some(process)) => {
                self.register(&process);
                Ok(Some(process as Arc<dyn SandboxProcess>))
            }
            Some(None) | None => Ok(None),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), CapabilityError> {
        lock(&self.removed_files).push(path.to_string());
        if self.remove_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StubMount
// ---------------------------------------------------------------------------

/// Counting [`StorageMount`].
pub struct StubMount {
    calls: AtomicU32,
    fails: AtomicBool,
}

impl Default for StubMount {
    fn default() -> Self {
        Self::new()
    }
}

impl StubMount {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fails: AtomicBool::new(false),
        }
    }

    /// Every mount attempt fails.
    pub fn failing() -> Self {
        let mount = Self::new();
        mount.fails.store(true, Ordering::SeqCst);
        mount
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageMount for StubMount {
    async fn mount(&self) -> Result<(), CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::MountFailed {
                reason: "device busy".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Config with short timeouts so lifecycle tests finish in milliseconds.
pub fn fast_config() -> GatewayConfig {
    GatewayConfig {
        startup_timeout: Duration::from_millis(250),
        graceful_stop_timeout: Duration::from_millis(100),
        health_check_timeout: Duration::from_millis(50),
        port_free_poll_interval: Duration::from_millis(10),
        port_free_deadline: Duration::from_millis(200),
        discovery_retry_delay: Duration::from_millis(10),
        ..GatewayConfig::default()
    }
}

/// A supervisor wired to stubs, with handles kept for assertions.
pub struct TestHarness {
    pub supervisor: Arc<GatewaySupervisor>,
    pub host: Arc<StubHost>,
    pub fetch: Arc<StubFetch>,
    pub mount: Arc<StubMount>,
    pub config: GatewayConfig,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }
}

/// Builder over the stub set. Defaults to a cold world: nothing
/// listening, no processes, mounts succeed.
pub struct TestHarnessBuilder {
    config: GatewayConfig,
    host: StubHost,
    fetch: StubFetch,
    mount: StubMount,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: fast_config(),
            host: StubHost::new(),
            fetch: StubFetch::refusing(),
            mount: StubMount::new(),
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: StubHost) -> Self {
        self.host = host;
        self
    }

    pub fn fetch(mut self, fetch: StubFetch) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn mount(mut self, mount: StubMount) -> Self {
        self.mount = mount;
        self
    }

    pub fn build(self) -> TestHarness {
        let host = Arc::new(self.host);
        let fetch = Arc::new(self.fetch);
        let mount = Arc::new(self.mount);
        let config = self.config.clone();

        let engine = LifecycleEngine::new(
            self.config,
            Arc::clone(&host) as Arc<dyn ProcessHost>,
            Arc::clone(&fetch) as Arc<dyn SandboxFetch>,
            Arc::clone(&mount) as Arc<dyn StorageMount>,
        );
        TestHarness {
            supervisor: Arc::new(GatewaySupervisor::new(engine)),
            host,
            fetch,
            mount,
            config,
        }
    }
}
