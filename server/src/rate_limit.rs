//! Fixed-window request limiters.
//!
//! Both limiters count requests per key inside a window that restarts once a
//! full window has elapsed since it opened. The post-auth limiter is keyed by
//! session id and only throttles. The pre-auth limiter is keyed by connection
//! id and additionally tracks consecutive authentication failures so the
//! server can drop a connection that keeps guessing.

use std::time::{Duration, Instant};

use dashmap::{mapref::one::RefMut, DashMap};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count:   u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    /// Counts one request; false when the ceiling is already used up
    fn admit(&mut self, now: Instant, length: Duration, ceiling: u32) -> bool {
        if now.duration_since(self.started) >= length {
            self.started = now;
            self.count = 0;
        }
        if self.count >= ceiling {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Per-session limiter applied to every request after authentication
pub struct RateLimiter {
    windows:        DashMap<String, Window>,
    max_per_window: u32,
    window:         Duration,
}

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self::with_window(max_per_second, WINDOW)
    }

    pub fn with_window(max_per_window: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_per_window,
            window,
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(now));
        entry.admit(now, self.window, self.max_per_window)
    }

    pub fn remove_client(&self, key: &str) {
        self.windows.remove(key);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct PreAuthState {
    window:   Window,
    failures: u32,
}

/// Stricter limiter for connections that have not authenticated yet
pub struct PreAuthRateLimiter {
    clients:        DashMap<String, PreAuthState>,
    max_per_window: u32,
    window:         Duration,
    max_failures:   u32,
}

impl PreAuthRateLimiter {
    pub fn new(max_per_second: u32, max_failures: u32) -> Self {
        Self::with_window(max_per_second, max_failures, WINDOW)
    }

    pub fn with_window(max_per_window: u32, max_failures: u32, window: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_per_window,
            window,
            max_failures,
        }
    }

    fn state(&self, key: &str, now: Instant) -> RefMut<'_, String, PreAuthState> {
        self.clients
            .entry(key.to_string())
            .or_insert_with(|| PreAuthState {
                window:   Window::new(now),
                failures: 0,
            })
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state(key, now);
        state.window.admit(now, self.window, self.max_per_window)
    }

    /// Records a failed authentication.
    ///
    /// Returns true once `max_failures` consecutive failures have been seen;
    /// the caller should close the connection.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut state = self.state(key, Instant::now());
        state.failures = state.failures.saturating_add(1);
        tracing::debug!(client = key, failures = state.failures, "Authentication failure recorded");
        state.failures >= self.max_failures
    }

    pub fn record_success(&self, key: &str) {
        if let Some(mut state) = self.clients.get_mut(key) {
            state.failures = 0;
        }
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.clients.get(key).map(|s| s.failures).unwrap_or(0)
    }

    pub fn remove_client(&self, key: &str) {
        self.clients.remove(key);
    }
}
