//! Process-wide timing and capacity knobs.
//!
//! These are the host's only process-wide mutable-free config, mirroring
//! the manifest directory: instance-scoped defaults, overridable by
//! environment variable, with nothing else global.

use std::time::Duration;

/// Environment variable overriding [`HostConfig::spawn_timeout`], in
/// milliseconds.
pub const SPAWN_TIMEOUT_MS_ENV: &str = "CJM_SPAWN_TIMEOUT_MS";
/// Environment variable overriding [`HostConfig::shutdown_grace`], in
/// milliseconds.
pub const SHUTDOWN_GRACE_MS_ENV: &str = "CJM_SHUTDOWN_GRACE_MS";
/// Environment variable overriding [`HostConfig::call_timeout`], in
/// milliseconds.
pub const CALL_TIMEOUT_MS_ENV: &str = "CJM_CALL_TIMEOUT_MS";
/// Environment variable overriding [`HostConfig::max_history`].
pub const MAX_HISTORY_ENV: &str = "CJM_MAX_HISTORY";
/// Environment variable overriding [`HostConfig::max_concurrent`].
pub const MAX_CONCURRENT_ENV: &str = "CJM_MAX_CONCURRENT";

/// Timeouts and capacity limits shared by the proxy and the job queue.
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    /// Bound on the spawn handshake. Default 30s.
    pub spawn_timeout: Duration,
    /// Grace window before escalating a shutdown request. Default 5s.
    pub shutdown_grace: Duration,
    /// Default bound on one proxy `call`. Default 60s.
    pub call_timeout: Duration,
    /// Capacity of the queue's bounded terminal-job history. Default 50.
    pub max_history: usize,
    /// Concurrent running jobs sharing the empty/`"cpu"` resource class.
    /// Default 1.
    pub max_concurrent: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            call_timeout: Duration::from_secs(60),
            max_history: 50,
            max_concurrent: 1,
        }
    }
}

impl HostConfig {
    /// Builds a config from defaults, overridden by any of the
    /// `CJM_*` environment variables that parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64(SPAWN_TIMEOUT_MS_ENV) {
            config.spawn_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64(SHUTDOWN_GRACE_MS_ENV) {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64(CALL_TIMEOUT_MS_ENV) {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64(MAX_HISTORY_ENV) {
            config.max_history = n as usize;
        }
        if let Some(n) = env_u64(MAX_CONCURRENT_ENV) {
            config.max_concurrent = n.max(1) as usize;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}
