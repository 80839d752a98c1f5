//! Runtime settings for the helper.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is
//! a valid configuration.

use std::{fs, path::Path, time::Duration};

use netpulse_common::config::AUTH_MAX_AGE_SECS;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    /// Ceiling on concurrently live sessions
    pub max_sessions: usize,

    /// Lifetime of a session before re-authentication is required
    pub session_ttl_secs: u64,

    /// Requests per second allowed on an authenticated session
    pub max_requests_per_second: u32,

    /// Authenticate attempts per second allowed before a session exists
    pub pre_auth_requests_per_second: u32,

    /// Consecutive failed authentications before the connection is dropped
    pub max_auth_failures: u32,

    /// Accepted clock skew for signed authentication timestamps
    pub auth_max_age_secs: u64,

    pub tracker_refresh_ms: u64,

    /// Connections unseen for longer than this are dropped from stats
    pub connection_stale_ms: u64,

    /// Whether an authenticated Shutdown request stops the whole helper
    pub stop_on_shutdown_request: bool,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_ttl_secs: 30 * 60,
            max_requests_per_second: 10,
            pre_auth_requests_per_second: 5,
            max_auth_failures: 3,
            auth_max_age_secs: AUTH_MAX_AGE_SECS,
            tracker_refresh_ms: 2_000,
            connection_stale_ms: 5_000,
            stop_on_shutdown_request: true,
        }
    }
}

impl HelperSettings {
    /// Loads and validates settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reports every out-of-range value, not just the first
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut problems = Vec::new();
        if self.max_sessions == 0 {
            problems.push("max_sessions must be at least 1".to_string());
        }
        if self.session_ttl_secs == 0 {
            problems.push("session_ttl_secs must be positive".to_string());
        }
        if self.max_requests_per_second == 0 {
            problems.push("max_requests_per_second must be at least 1".to_string());
        }
        if self.pre_auth_requests_per_second == 0 {
            problems.push("pre_auth_requests_per_second must be at least 1".to_string());
        }
        if self.max_auth_failures == 0 {
            problems.push("max_auth_failures must be at least 1".to_string());
        }
        if self.tracker_refresh_ms == 0 {
            problems.push("tracker_refresh_ms must be positive".to_string());
        }
        if self.connection_stale_ms < self.tracker_refresh_ms {
            problems.push(format!(
                "connection_stale_ms ({}) must not be shorter than tracker_refresh_ms ({})",
                self.connection_stale_ms, self.tracker_refresh_ms
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(problems))
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn tracker_refresh(&self) -> Duration {
        Duration::from_millis(self.tracker_refresh_ms)
    }

    pub fn connection_stale_after(&self) -> Duration {
        Duration::from_millis(self.connection_stale_ms)
    }
}
