//! Per-model fixed-window rate limiting.
//!
//! Windows are aligned to wall-clock minutes: the counter resets at each
//! minute boundary, not one minute after the first request.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

struct WindowState {
    limit: u32,
    window: i64,
    count: u32,
}

/// Fixed-window limiter keyed by model id. Models without a configured
/// limit are never throttled.
pub struct RateLimiter {
    windows: DashMap<String, Mutex<WindowState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Set (or replace) a model's requests-per-minute budget.
    pub fn set_limit(&self, model_id: &str, requests_per_minute: u32) {
        self.windows.insert(
            model_id.to_string(),
            Mutex::new(WindowState {
                limit: requests_per_minute,
                window: current_window(),
                count: 0,
            }),
        );
    }

    /// Remove a model's limit entirely.
    pub fn clear_limit(&self, model_id: &str) {
        self.windows.remove(model_id);
    }

    /// Account one request. Returns false when the window is exhausted.
    pub fn check(&self, model_id: &str) -> bool {
        let Some(entry) = self.windows.get(model_id) else {
            return true; // no limit configured
        };
        let mut state = entry.lock();

        let window = current_window();
        if state.window != window {
            state.window = window;
            state.count = 0;
        }

        if state.count >= state.limit {
            return false;
        }
        state.count += 1;
        true
    }

    /// Requests still allowed in the current window, if a limit is set.
    pub fn remaining(&self, model_id: &str) -> Option<u32> {
        let entry = self.windows.get(model_id)?;
        let state = entry.lock();
        if state.window != current_window() {
            return Some(state.limit);
        }
        Some(state.limit.saturating_sub(state.count))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn current_window() -> i64 {
    Utc::now().timestamp() / 60
}
