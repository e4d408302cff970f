//! Auto-recovery: exponential-backoff restarts for degraded models.
//!
//! Each degradation signal schedules at most one restart. The attempt
//! counter survives across episodes and only resets once the model probes
//! healthy again; exhausting `max_attempts` leaves the model in ERROR.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::manager::LifecycleManager;
use crate::models::RetryPolicy;
use crate::telemetry::record_restart;

/// Restart bookkeeping for one model.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryState {
    /// Restarts performed since the model last probed healthy.
    pub attempt: u32,
    /// When the next restart may run, if one is scheduled.
    pub next_allowed_at: Option<DateTime<Utc>>,
    /// A recovery task is currently scheduled or running.
    pub in_flight: bool,
}

/// Backoff delay for the given attempt (1-based):
/// `min(max_delay, initial_delay * backoff_factor^(attempt-1))`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = policy.initial_delay as f64 * policy.backoff_factor.powi(exponent as i32);
    Duration::from_secs_f64(delay.min(policy.max_delay as f64))
}

/// Restart controller consuming health degradation signals.
pub struct AutoRecovery {
    manager: Arc<LifecycleManager>,
    states: DashMap<String, RecoveryState>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AutoRecovery {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self {
            manager,
            states: DashMap::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// React to a degradation signal: schedule one backoff restart.
    ///
    /// A signal arriving while a recovery is already in flight is ignored.
    pub fn handle_degraded(self: &Arc<Self>, model_id: &str) {
        {
            let mut state = self.states.entry(model_id.to_string()).or_default();
            if state.in_flight {
                tracing::debug!(model_id, "recovery already in flight; signal ignored");
                return;
            }
            state.in_flight = true;
        }

        let recovery = Arc::clone(self);
        let model_id = model_id.to_string();
        let handle = tokio::spawn(async move {
            recovery.run_recovery(&model_id).await;
            if let Some(mut state) = recovery.states.get_mut(&model_id) {
                state.in_flight = false;
                state.next_allowed_at = None;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Reset the attempt counter once the model probes healthy again.
    pub fn handle_recovered(&self, model_id: &str) {
        if let Some(mut state) = self.states.get_mut(model_id) {
            if state.attempt > 0 {
                tracing::info!(model_id, "model recovered; retry counter reset");
            }
            state.attempt = 0;
        }
    }

    /// Current bookkeeping for one model.
    pub fn state(&self, model_id: &str) -> Option<RecoveryState> {
        self.states.get(model_id).map(|s| s.clone())
    }

    /// Drop bookkeeping for a deleted model.
    pub fn forget(&self, model_id: &str) {
        self.states.remove(model_id);
    }

    /// Abort any scheduled recovery tasks.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    async fn run_recovery(&self, model_id: &str) {
        let Ok(config) = self.manager.get_config(model_id).await else {
            return; // deleted in the meantime
        };
        let policy = config.retry_policy;
        if !policy.enabled {
            tracing::debug!(model_id, "retry policy disabled; no restart");
            return;
        }

        let attempt = {
            let state = self.states.get(model_id).map(|s| s.clone()).unwrap_or_default();
            state.attempt
        };
        if attempt >= policy.max_attempts {
            tracing::error!(
                model_id,
                attempts = attempt,
                "retry budget exhausted; marking model failed"
            );
            let _ = self.manager.mark_failed(model_id).await;
            return;
        }

        let attempt = attempt + 1;
        let delay = backoff_delay(&policy, attempt);
        if let Some(mut state) = self.states.get_mut(model_id) {
            state.attempt = attempt;
            state.next_allowed_at =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        }

        tracing::warn!(
            model_id,
            attempt,
            max_attempts = policy.max_attempts,
            delay_secs = delay.as_secs_f64(),
            "scheduling restart"
        );
        tokio::time::sleep(delay).await;

        record_restart(model_id, attempt);
        match self.manager.restart(model_id).await {
            Ok(()) => {
                tracing::info!(model_id, attempt, "restart completed");
            }
            Err(e) => {
                tracing::error!(model_id, attempt, error = %e, "restart failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, max_delay: u64, factor: f64) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts: 3,
            initial_delay: initial,
            max_delay,
            backoff_factor: factor,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy(1, 300, 2.0);
        assert_eq!(backoff_delay(&p, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&p, 4), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let p = policy(10, 60, 3.0);
        assert_eq!(backoff_delay(&p, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(&p, 2), Duration::from_secs(30));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(60)); // 90 capped
        assert_eq!(backoff_delay(&p, 10), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_factor_one_is_constant() {
        let p = policy(5, 300, 1.0);
        for attempt in 1..6 {
            assert_eq!(backoff_delay(&p, attempt), Duration::from_secs(5));
        }
    }
}
