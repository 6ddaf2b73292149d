//! Serialized ownership of one supervised gateway.

use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::LifecycleEngine;
use crate::error::Result;
use crate::state::{StateCell, StateSnapshot};

/// Owns the cached gateway state and the gate that serializes lifecycle
/// transitions.
///
/// `ensure` and `restart` queue behind a single mutex, so at most one
/// engine invocation is ever in flight and each caller observes the
/// state its predecessors left behind. `state` reads the cache without
/// touching the gate and never waits on a transition.
pub struct GatewaySupervisor {
    engine: LifecycleEngine,
    state: StateCell,
    /// Transition gate. Holding the guard is the in-flight marker;
    /// dropping it, on success or failure alike, admits the next caller.
    transition: Mutex<()>,
}

impl GatewaySupervisor {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self {
            engine,
            state: StateCell::new(),
            transition: Mutex::new(()),
        }
    }

    /// Bring the gateway to a usable state, reusing a live instance when
    /// one is found. Queues behind any in-flight transition.
    pub async fn ensure(&self) -> Result<StateSnapshot> {
        let _gate = self.transition.lock().await;
        debug!("Ensure transition admitted");
        self.engine.ensure(&self.state).await?;
        Ok(self.state.snapshot().await)
    }

    /// Tear the gateway down and bring a fresh instance up, regardless of
    /// current health. Queues behind any in-flight transition.
    pub async fn restart(&self) -> Result<StateSnapshot> {
        let _gate = self.transition.lock().await;
        debug!("Restart transition admitted");
        self.engine.restart(&self.state).await?;
        Ok(self.state.snapshot().await)
    }

    /// Snapshot of the cached state. Values may be mid-transition stale;
    /// callers that need a settled answer use [`ensure`](Self::ensure).
    pub async fn state(&self) -> StateSnapshot {
        self.state.snapshot().await
    }
}
