//! Lifecycle decisions for the supervised gateway.
//!
//! The engine owns no state of its own. It reads and mutates the shared
//! [`StateCell`] while the supervisor's transition gate is held, and it
//! touches the outside world only through the capability traits, so every
//! decision it makes can be replayed against scripted stubs.
//!
//! Recovery is layered cheapest-first: trust the cache, then probe for a
//! live instance, then adopt a starting one, then tear down whatever is
//! in the way and start fresh.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capabilities::{ProcessHost, SandboxFetch, SandboxProcess, StorageMount};
use crate::config::GatewayConfig;
use crate::error::{Result, SupervisorError};
use crate::state::StateCell;

/// Longest stderr tail embedded in a startup failure.
const STDERR_TAIL_MAX_BYTES: usize = 2048;

/// Outcome of one best-effort teardown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran and did what it set out to do.
    Completed,
    /// The step had nothing to act on.
    Skipped,
    /// The step ran and failed. The failure was logged and absorbed.
    Failed,
}

/// Per-layer outcomes of one teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Asking the gateway to stop through its own CLI.
    pub graceful: StepOutcome,
    /// Forceful kill of the tracked process.
    pub tracked_kill: StepOutcome,
    /// Kill of anything else still matching the gateway signature.
    pub signature_kill: StepOutcome,
}

/// Drives the gateway through its lifecycle using only the sandbox
/// capabilities.
pub struct LifecycleEngine {
    config: GatewayConfig,
    host: Arc<dyn ProcessHost>,
    fetch: Arc<dyn SandboxFetch>,
    storage: Arc<dyn StorageMount>,
}

impl LifecycleEngine {
    pub fn new(
        config: GatewayConfig,
        host: Arc<dyn ProcessHost>,
        fetch: Arc<dyn SandboxFetch>,
        storage: Arc<dyn StorageMount>,
    ) -> Self {
        Self {
            config,
            host,
            fetch,
            storage,
        }
    }

    /// Bring the gateway to a usable state, preferring the cheapest path
    /// that gets there.
    ///
    /// Must run with the supervisor's transition gate held; `state` is
    /// read and written without further coordination.
    pub async fn ensure(&self, state: &StateCell) -> Result<()> {
        // Cached readiness is trusted outright. The cache is only ever set
        // after a confirmed observation and cleared on every teardown.
        if state.is_ready().await {
            debug!("Gateway already marked ready, skipping probes");
            return Ok(());
        }

        // A live gateway may exist even though the cache says otherwise,
        // e.g. after a supervisor restart. Probe before touching anything.
        if self.probe_healthy().await {
            state.mark_ready(Utc::now()).await;
            match self.discover_process().await {
                Some(process) => {
                    info!(
                        "Reusing healthy gateway on port {} (process {})",
                        self.config.port,
                        process.id()
                    );
                    state.record_process(process.id(), Utc::now()).await;
                }
                None => {
                    info!(
                        "Reusing healthy gateway on port {}, process not identified",
                        self.config.port
                    );
                }
            }
            return Ok(());
        }

        // Not reachable yet, but a process may still be booting. Give it
        // the full startup window before writing it off.
        match self
            .host
            .find_by_signature(&self.config.process_signature)
            .await
        {
            Ok(Some(existing)) => {
                info!(
                    "Found existing gateway process {}, waiting for port {}",
                    existing.id(),
                    self.config.port
                );
                match existing
                    .wait_for_port(self.config.port, self.config.startup_timeout)
                    .await
                {
                    Ok(()) => {
                        state.mark_started(existing.id(), Utc::now()).await;
                        info!("Existing gateway process {} became reachable", existing.id());
                        return Ok(());
                    }
                    Err(wait_error) => {
                        warn!(
                            %wait_error,
                            "Existing gateway process {} never opened its port, killing it",
                            existing.id()
                        );
                        self.kill_quietly(existing.as_ref()).await;
                    }
                }
            }
            Ok(None) => {}
            Err(list_error) => {
                // Listing flakiness must never block recovery.
                debug!(%list_error, "Process lookup failed, assuming no existing gateway");
            }
        }

        // Something unhealthy may still hold the port, e.g. an instance
        // that answers 5xx or one the listing missed. Clear it out so the
        // fresh start does not fight over the bind.
        if self.probe_listening().await {
            warn!(
                "Port {} still occupied by an unresponsive gateway, tearing it down",
                self.config.port
            );
            let report = self.stop(state).await;
            debug!(?report, "Teardown of port occupant finished");
            self.wait_for_port_free().await;
            state.clear_process().await;
        }

        self.start_fresh(state).await
    }

    /// Tear the gateway down and bring a fresh instance up, regardless of
    /// current health.
    ///
    /// Must run with the supervisor's transition gate held.
    pub async fn restart(&self, state: &StateCell) -> Result<()> {
        info!("Restarting gateway");
        let report = self.stop(state).await;
        info!(?report, "Gateway teardown finished");
        state.clear_process().await;

        let artifacts = self.clear_lock_artifacts().await;
        debug!(?artifacts, "Lock artifact cleanup finished");
        self.wait_for_port_free().await;

        self.ensure(state).await
    }

    /// Layered best-effort teardown. Never fails; each layer's outcome is
    /// reported so callers can log the decision trail.
    ///
    /// Leaves `state` untouched. Callers clear the tracked process once
    /// the whole sequence is done.
    async fn stop(&self, state: &StateCell) -> StopReport {
        // Layer 1: ask the gateway to stop itself. Covers children and
        // lock files its own shutdown path knows about.
        let graceful = match self
            .host
            .exec(&self.config.stop_command, self.config.graceful_stop_timeout)
            .await
        {
            Ok(0) => {
                debug!("Graceful stop command succeeded");
                StepOutcome::Completed
            }
            Ok(code) => {
                warn!("Graceful stop command exited with code {code}");
                StepOutcome::Failed
            }
            Err(exec_error) => {
                warn!(%exec_error, "Graceful stop command failed");
                StepOutcome::Failed
            }
        };

        // Layer 2: forcefully kill the tracked process if it is still
        // alive in the current listing.
        let tracked_kill = match state.process_id().await {
            None => StepOutcome::Skipped,
            Some(id) => match self.host.list().await {
                Ok(processes) => {
                    let tracked = processes
                        .iter()
                        .find(|process| process.id() == id && process.status().is_alive());
                    match tracked {
                        Some(process) => self.kill_quietly(process.as_ref()).await,
                        None => StepOutcome::Skipped,
                    }
                }
                Err(list_error) => {
                    warn!(%list_error, "Process listing failed while stopping tracked process");
                    StepOutcome::Failed
                }
            },
        };

        // Layer 3: sweep for anything else still matching the gateway
        // signature. Catches identifiers that drifted between listings.
        let signature_kill = match self
            .host
            .find_by_signature(&self.config.process_signature)
            .await
        {
            Ok(Some(process)) => self.kill_quietly(process.as_ref()).await,
            Ok(None) => StepOutcome::Skipped,
            Err(list_error) => {
                warn!(%list_error, "Signature sweep failed during teardown");
                StepOutcome::Failed
            }
        };

        StopReport {
            graceful,
            tracked_kill,
            signature_kill,
        }
    }

    /// Mount storage, spawn the gateway, and wait for its port.
    async fn start_fresh(&self, state: &StateCell) -> Result<()> {
        // The start command persists data under the mount; starting
        // without it would write into the container's scratch layer.
        self.storage
            .mount()
            .await
            .map_err(|mount_error| SupervisorError::MountFailed {
                reason: mount_error.to_string(),
            })?;

        info!("Starting gateway: {}", self.config.start_command);
        let env = self.config.build_env_vars();
        let process = self
            .host
            .start(&self.config.start_command, &env)
            .await
            .map_err(|spawn_error| SupervisorError::SpawnFailed {
                reason: spawn_error.to_string(),
            })?;

        // Recorded before readiness so a failed boot still leaves an
        // identifier for the next teardown to act on.
        state.record_process(process.id(), Utc::now()).await;

        match process
            .wait_for_port(self.config.port, self.config.startup_timeout)
            .await
        {
            Ok(()) => {
                state.mark_ready(Utc::now()).await;
                info!(
                    "Gateway process {} is up on port {}",
                    process.id(),
                    self.config.port
                );
                Ok(())
            }
            Err(wait_error) => {
                let diagnostics = self.startup_diagnostics(process.as_ref(), &wait_error).await;
                error!(
                    "Gateway process {} failed to open port {}: {diagnostics}",
                    process.id(),
                    self.config.port
                );
                Err(SupervisorError::StartupTimeout {
                    port: self.config.port,
                    timeout: self.config.startup_timeout,
                    diagnostics,
                })
            }
        }
    }

    /// Build the human-readable failure detail for a start that never
    /// opened its port, folding in the stderr tail when there is one.
    async fn startup_diagnostics(
        &self,
        process: &dyn SandboxProcess,
        wait_error: &crate::error::CapabilityError,
    ) -> String {
        match process.logs().await {
            Ok(logs) => {
                let tail = stderr_tail(&logs.stderr, STDERR_TAIL_MAX_BYTES);
                if tail.is_empty() {
                    format!("{wait_error}; no stderr captured")
                } else {
                    format!("{wait_error}; stderr: {tail}")
                }
            }
            Err(logs_error) => format!("{wait_error}; logs unavailable: {logs_error}"),
        }
    }

    /// Kill wrapper that never lets a failure abort a larger sequence.
    async fn kill_quietly(&self, process: &dyn SandboxProcess) -> StepOutcome {
        match process.kill().await {
            Ok(()) => {
                info!("Killed gateway process {}", process.id());
                StepOutcome::Completed
            }
            Err(kill_error) => {
                warn!(%kill_error, "Failed to kill gateway process {}", process.id());
                StepOutcome::Failed
            }
        }
    }

    /// Find the live gateway process, retrying once after a short delay.
    /// Listings are eventually consistent right after a boot.
    async fn discover_process(&self) -> Option<Arc<dyn SandboxProcess>> {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(self.config.discovery_retry_delay).await;
            }
            match self
                .host
                .find_by_signature(&self.config.process_signature)
                .await
            {
                Ok(Some(process)) => return Some(process),
                Ok(None) => {}
                Err(list_error) => {
                    debug!(%list_error, "Process discovery attempt {attempt} failed");
                }
            }
        }
        None
    }

    /// Strict health probe: a response counts as healthy only when it is
    /// not a server error. Refusals, timeouts, and 5xx all read as "not
    /// healthy"; none of them is an error to the caller.
    async fn probe_healthy(&self) -> bool {
        match self
            .fetch
            .fetch(
                self.config.port,
                &self.config.health_path,
                self.config.health_check_timeout,
            )
            .await
        {
            Ok(response) => !response.is_server_error(),
            Err(probe_error) => {
                debug!(%probe_error, "Health probe got no response");
                false
            }
        }
    }

    /// Occupancy probe: any response at all means something still holds
    /// the port, even an instance that only answers 5xx.
    async fn probe_listening(&self) -> bool {
        self.fetch
            .fetch(
                self.config.port,
                &self.config.health_path,
                self.config.health_check_timeout,
            )
            .await
            .is_ok()
    }

    /// Poll until nothing answers on the service port or the deadline
    /// elapses. An elapsed deadline is logged, not fatal; the subsequent
    /// start proceeds and surfaces any real bind conflict itself.
    async fn wait_for_port_free(&self) -> StepOutcome {
        let deadline = Instant::now() + self.config.port_free_deadline;
        loop {
            if !self.probe_listening().await {
                return StepOutcome::Completed;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Port {} still occupied after {:?}, proceeding anyway",
                    self.config.port, self.config.port_free_deadline
                );
                return StepOutcome::Failed;
            }
            tokio::time::sleep(self.config.port_free_poll_interval).await;
        }
    }

    /// Remove the enumerated lock files a dead gateway leaves behind.
    /// Exact paths only; the gateway home directory is never swept.
    async fn clear_lock_artifacts(&self) -> Vec<(String, StepOutcome)> {
        let mut outcomes = Vec::with_capacity(self.config.lock_artifacts.len());
        for path in &self.config.lock_artifacts {
            let outcome = match self.host.remove_file(path).await {
                Ok(()) => StepOutcome::Completed,
                Err(remove_error) => {
                    warn!(%remove_error, "Failed to remove lock artifact {path}");
                    StepOutcome::Failed
                }
            };
            outcomes.push((path.clone(), outcome));
        }
        outcomes
    }
}

/// Last `max_bytes` of captured stderr, cut on a char boundary.
fn stderr_tail(stderr: &str, max_bytes: usize) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ProbeScript, StubFetch, StubHost, StubMount};

    fn engine_with_fetch(fetch: StubFetch) -> LifecycleEngine {
        LifecycleEngine::new(
            crate::testing::fast_config(),
            Arc::new(StubHost::new()),
            Arc::new(fetch),
            Arc::new(StubMount::new()),
        )
    }

    #[tokio::test]
    async fn healthy_probe_accepts_client_errors() {
        // A 404 from the health path still proves the gateway is up and
        // serving; only 5xx marks it broken.
        let engine = engine_with_fetch(StubFetch::always(ProbeScript::Status(404)));
        assert!(engine.probe_healthy().await);
    }

    #[tokio::test]
    async fn healthy_probe_rejects_server_errors_and_refusals() {
        let engine = engine_with_fetch(StubFetch::always(ProbeScript::Status(503)));
        assert!(!engine.probe_healthy().await);

        let engine = engine_with_fetch(StubFetch::refusing());
        assert!(!engine.probe_healthy().await);
    }

    #[tokio::test]
    async fn listening_probe_counts_server_errors_as_occupied() {
        let engine = engine_with_fetch(StubFetch::always(ProbeScript::Status(500)));
        assert!(engine.probe_listening().await);

        let engine = engine_with_fetch(StubFetch::refusing());
        assert!(!engine.probe_listening().await);
    }

    #[tokio::test]
    async fn port_free_wait_returns_once_refused() {
        let fetch = StubFetch::scripted(
            vec![ProbeScript::Status(500), ProbeScript::Status(500)],
            ProbeScript::Refused,
        );
        let engine = engine_with_fetch(fetch);
        assert_eq!(engine.wait_for_port_free().await, StepOutcome::Completed);
    }

    #[tokio::test]
    async fn port_free_wait_gives_up_at_deadline() {
        // Always-occupied port: the wait must end in bounded time and
        // report failure instead of hanging the restart.
        let engine = engine_with_fetch(StubFetch::always(ProbeScript::Status(200)));
        assert_eq!(engine.wait_for_port_free().await, StepOutcome::Failed);
    }

    #[test]
    fn stderr_tail_keeps_short_input_intact() {
        assert_eq!(stderr_tail("boot error: disk full\n", 2048), "boot error: disk full");
        assert_eq!(stderr_tail("", 2048), "");
    }

    #[test]
    fn stderr_tail_truncates_from_the_front() {
        let long = format!("{}END", "x".repeat(5000));
        let tail = stderr_tail(&long, 16);
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("END"), "the most recent output must survive");
        assert!(tail.len() <= 16 + 3);
    }

    #[test]
    fn stderr_tail_respects_char_boundaries() {
        let multibyte = "é".repeat(100);
        let tail = stderr_tail(&multibyte, 7);
        assert!(tail.ends_with('é'));
    }
}
