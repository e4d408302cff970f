//! Health checking and auto-recovery for running model instances.

mod checker;
mod recovery;

pub use checker::{
    DegradedCallback, HealthChecker, HealthDetails, HealthStats, TransitionCallback,
};
pub use recovery::{backoff_delay, AutoRecovery, RecoveryState};
