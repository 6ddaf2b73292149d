//! Cached lifecycle state for the supervised gateway.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// What the supervisor currently believes about the gateway process.
///
/// This is a cache, never a source of truth. It starts empty on every
/// supervisor boot and is rebuilt from live probes, so a stale entry can
/// cost a redundant probe but never a wrong answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayState {
    /// Identifier of the last known gateway process.
    pub process_id: Option<String>,
    /// When the most recent start attempt (or adoption) happened.
    pub last_start_attempt: Option<DateTime<Utc>>,
    /// Whether the gateway is believed healthy and reachable.
    pub ready: bool,
    /// When `ready` was last confirmed by a probe or a readiness wait.
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the cached state, shaped for API responses.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub ready: bool,
    pub process_id: Option<String>,
    pub last_start_attempt: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Shared cell holding the state of one supervised gateway.
///
/// Every mutator takes a single write guard for the whole update, so
/// related fields (`process_id` and `ready` in particular) can never be
/// observed half-changed.
#[derive(Debug, Default)]
pub struct StateCell {
    inner: RwLock<GatewayState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.inner.read().await;
        StateSnapshot {
            ready: state.ready,
            process_id: state.process_id.clone(),
            last_start_attempt: state.last_start_attempt,
            last_health_check: state.last_health_check,
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.ready
    }

    pub async fn process_id(&self) -> Option<String> {
        self.inner.read().await.process_id.clone()
    }

    /// Record a confirmed-healthy observation.
    pub async fn mark_ready(&self, now: DateTime<Utc>) {
        let mut state = self.inner.write().await;
        state.ready = true;
        state.last_health_check = Some(now);
    }

    /// Record the process the gateway is running as. Does not touch
    /// readiness; callers confirm that separately.
    pub async fn record_process(&self, id: impl Into<String>, now: DateTime<Utc>) {
        let mut state = self.inner.write().await;
        state.process_id = Some(id.into());
        state.last_start_attempt = Some(now);
    }

    /// Record a process that is both identified and confirmed reachable,
    /// in one update.
    pub async fn mark_started(&self, id: impl Into<String>, now: DateTime<Utc>) {
        let mut state = self.inner.write().await;
        state.process_id = Some(id.into());
        state.last_start_attempt = Some(now);
        state.ready = true;
        state.last_health_check = Some(now);
    }

    /// Forget the tracked process. Clears `ready` in the same update; a
    /// cleared identifier with a lingering ready flag would claim health
    /// for a process that no longer exists.
    pub async fn clear_process(&self) {
        let mut state = self.inner.write().await;
        state.process_id = None;
        state.ready = false;
    }
}
