//! Gateway supervision configuration.
//!
//! Every knob has a compiled-in default and an environment override, so
//! the binary runs with no configuration at all and deployments adjust
//! only what differs. Resolution never reads anything but the process
//! environment.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default TCP port the gateway serves on inside the sandbox.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Default directory holding the gateway's runtime artifacts.
pub const DEFAULT_GATEWAY_HOME: &str = "/root/.gateway";

/// Settings for one supervised gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port the gateway serves on.
    pub port: u16,
    /// Command that launches the gateway process.
    pub start_command: String,
    /// Command that asks a running gateway to shut down via its own CLI.
    pub stop_command: String,
    /// Substring identifying gateway processes in a process listing.
    /// Must not match the stop command's own process.
    pub process_signature: String,
    /// Path probed for health checks.
    pub health_path: String,
    /// Directory the gateway keeps its runtime state in.
    pub home_dir: String,
    /// How long a starting gateway may take to open its port.
    pub startup_timeout: Duration,
    /// Bound on the graceful stop command.
    pub graceful_stop_timeout: Duration,
    /// Bound on a single health probe.
    pub health_check_timeout: Duration,
    /// Interval between polls while waiting for the port to free up.
    pub port_free_poll_interval: Duration,
    /// Overall deadline for the port-free wait.
    pub port_free_deadline: Duration,
    /// Delay before the single process-discovery retry.
    pub discovery_retry_delay: Duration,
    /// Exact lock-artifact paths removed during a restart. Never a glob;
    /// the gateway home directory is shared with live state.
    pub lock_artifacts: Vec<String>,
    /// Extra environment variables passed to a freshly started gateway.
    pub extra_env: Vec<(String, String)>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_GATEWAY_PORT,
            start_command: "gateway run".to_string(),
            stop_command: "gateway stop".to_string(),
            process_signature: "gateway run".to_string(),
            health_path: "/".to_string(),
            home_dir: DEFAULT_GATEWAY_HOME.to_string(),
            startup_timeout: Duration::from_secs(30),
            graceful_stop_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
            port_free_poll_interval: Duration::from_millis(500),
            port_free_deadline: Duration::from_secs(10),
            discovery_retry_delay: Duration::from_secs(1),
            lock_artifacts: default_lock_artifacts(DEFAULT_GATEWAY_HOME),
            extra_env: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Resolve configuration from the process environment on top of the
    /// defaults.
    ///
    /// Recognized variables: `GATEWAY_PORT`, `GATEWAY_START_COMMAND`,
    /// `GATEWAY_STOP_COMMAND`, `GATEWAY_PROCESS_SIGNATURE`,
    /// `GATEWAY_HEALTH_PATH`, `GATEWAY_HOME`, `GATEWAY_LOCK_ARTIFACTS`
    /// (comma-separated paths), `GATEWAY_STARTUP_TIMEOUT_SECS`,
    /// `GATEWAY_STOP_TIMEOUT_SECS`, `GATEWAY_HEALTH_TIMEOUT_MS`,
    /// `GATEWAY_PORT_FREE_POLL_MS`, `GATEWAY_PORT_FREE_DEADLINE_SECS`,
    /// `GATEWAY_DISCOVERY_RETRY_MS`.
    pub fn resolve() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = parse_optional_env::<u16>("GATEWAY_PORT")? {
            config.port = port;
        }
        if let Some(command) = optional_env("GATEWAY_START_COMMAND")? {
            config.start_command = command;
        }
        if let Some(command) = optional_env("GATEWAY_STOP_COMMAND")? {
            config.stop_command = command;
        }
        if let Some(signature) = optional_env("GATEWAY_PROCESS_SIGNATURE")? {
            config.process_signature = signature;
        }
        if let Some(path) = optional_env("GATEWAY_HEALTH_PATH")? {
            config.health_path = path;
        }
        if let Some(home) = optional_env("GATEWAY_HOME")? {
            config.lock_artifacts = default_lock_artifacts(&home);
            config.home_dir = home;
        }
        if let Some(raw) = optional_env("GATEWAY_LOCK_ARTIFACTS")? {
            config.lock_artifacts = parse_lock_artifacts(&raw);
        }
        if let Some(secs) = parse_optional_env::<u64>("GATEWAY_STARTUP_TIMEOUT_SECS")? {
            config.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_optional_env::<u64>("GATEWAY_STOP_TIMEOUT_SECS")? {
            config.graceful_stop_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_optional_env::<u64>("GATEWAY_HEALTH_TIMEOUT_MS")? {
            config.health_check_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional_env::<u64>("GATEWAY_PORT_FREE_POLL_MS")? {
            config.port_free_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_optional_env::<u64>("GATEWAY_PORT_FREE_DEADLINE_SECS")? {
            config.port_free_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_optional_env::<u64>("GATEWAY_DISCOVERY_RETRY_MS")? {
            config.discovery_retry_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Assemble the environment for a fresh gateway process.
    ///
    /// Pure: reads only this config. `extra_env` entries win over the
    /// built-in ones, so deployments can override anything.
    pub fn build_env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("GATEWAY_PORT".to_string(), self.port.to_string());
        env.insert("GATEWAY_HOME".to_string(), self.home_dir.clone());
        for (key, value) in &self.extra_env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

fn default_lock_artifacts(home: &str) -> Vec<String> {
    vec![
        format!("{home}/gateway.lock"),
        format!("{home}/gateway.pid"),
    ]
}

/// Split a comma-separated artifact list, dropping empty segments.
fn parse_lock_artifacts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read an environment variable, treating unset and empty as absent.
fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode {
            key: key.to_string(),
        }),
    }
}

/// Read and parse an environment variable if present.
fn parse_optional_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional_env(key)? {
        Some(raw) => parse_value(key, &raw).map(Some),
        None => Ok(None),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 18789);
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.graceful_stop_timeout, Duration::from_secs(5));
        assert_eq!(config.health_check_timeout, Duration::from_secs(2));
        assert_eq!(config.port_free_poll_interval, Duration::from_millis(500));
        assert_eq!(config.port_free_deadline, Duration::from_secs(10));
        assert_eq!(config.discovery_retry_delay, Duration::from_secs(1));
        assert_eq!(
            config.lock_artifacts,
            vec![
                "/root/.gateway/gateway.lock".to_string(),
                "/root/.gateway/gateway.pid".to_string(),
            ]
        );
    }

    #[test]
    fn signature_does_not_match_stop_command() {
        // The teardown sweep kills by signature while the stop command may
        // itself still be running. The defaults must not collide.
        let config = GatewayConfig::default();
        assert!(!config.stop_command.contains(&config.process_signature));
    }

    #[test]
    fn build_env_vars_exposes_port_and_home() {
        let config = GatewayConfig::default();
        let env = config.build_env_vars();
        assert_eq!(env.get("GATEWAY_PORT").map(String::as_str), Some("18789"));
        assert_eq!(
            env.get("GATEWAY_HOME").map(String::as_str),
            Some("/root/.gateway")
        );
    }

    #[test]
    fn build_env_vars_lets_extras_override() {
        let config = GatewayConfig {
            extra_env: vec![
                ("GATEWAY_PORT".to_string(), "9999".to_string()),
                ("GATEWAY_LOG".to_string(), "debug".to_string()),
            ],
            ..GatewayConfig::default()
        };
        let env = config.build_env_vars();
        assert_eq!(env.get("GATEWAY_PORT").map(String::as_str), Some("9999"));
        assert_eq!(env.get("GATEWAY_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn parse_value_reports_key_and_raw() {
        let err = parse_value::<u16>("GATEWAY_PORT", "not-a-port")
            .expect_err("garbage must not parse");
        let message = err.to_string();
        assert!(message.contains("GATEWAY_PORT"), "got: {message}");
        assert!(message.contains("not-a-port"), "got: {message}");
    }

    #[test]
    fn parse_value_trims_whitespace() {
        let port: u16 = parse_value("GATEWAY_PORT", " 18789 ")
            .unwrap_or_else(|e| panic!("padded value should parse: {e}"));
        assert_eq!(port, 18789);
    }

    #[test]
    fn lock_artifact_list_splits_and_trims() {
        assert_eq!(
            parse_lock_artifacts("/a/x.lock, /b/y.pid,,"),
            vec!["/a/x.lock".to_string(), "/b/y.pid".to_string()]
        );
        assert!(parse_lock_artifacts("  ,").is_empty());
    }

    #[test]
    fn default_artifacts_follow_home() {
        assert_eq!(
            default_lock_artifacts("/data/gw"),
            vec!["/data/gw/gateway.lock".to_string(), "/data/gw/gateway.pid".to_string()]
        );
    }
}
