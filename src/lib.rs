//! Gateward supervises a single long-running gateway process inside a
//! sandboxed execution environment.
//!
//! At most one lifecycle transition runs at a time, so concurrent
//! callers never race a start against a teardown and each observes the
//! state its predecessors left behind. Two layers split the work:
//!
//! - [`GatewaySupervisor`] owns the cached [`GatewayState`] and the
//!   transition gate that serializes `ensure` and `restart`.
//! - [`LifecycleEngine`] decides, from live probes and the cache,
//!   whether to reuse, adopt, tear down, or freshly start the gateway.
//!   It acts on the world only through the traits in [`capabilities`].
//!
//! [`host`] implements those traits against plain host processes so the
//! binary runs without a real sandbox; [`server`] exposes the supervisor
//! over HTTP; [`testing`] provides scripted stubs for replaying exact
//! failure situations.

pub mod capabilities;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod testing;

pub use capabilities::{ProcessHost, ProcessStatus, SandboxFetch, SandboxProcess, StorageMount};
pub use config::GatewayConfig;
pub use engine::{LifecycleEngine, StepOutcome};
pub use error::{CapabilityError, ConfigError, Result, SupervisorError};
pub use state::{GatewayState, StateSnapshot};
pub use supervisor::GatewaySupervisor;
