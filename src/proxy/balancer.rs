//! Pluggable load-balancing strategies.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Strategy for picking among available endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
}

/// One selectable endpoint, with its live connection count.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub model_id: String,
    pub connections: u32,
}

/// Endpoint selector with a persistent round-robin cursor.
///
/// The cursor is a single atomic: concurrent picks advance it
/// monotonically, so over N picks against a stable set of K endpoints
/// each endpoint is chosen either floor(N/K) or ceil(N/K) times.
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Pick one endpoint from an ordered candidate slice.
    pub fn pick(&self, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::SeqCst) % candidates.len();
                Some(candidates[index].model_id.clone())
            }
            LoadBalancingStrategy::LeastConnections => {
                let min = candidates.iter().map(|c| c.connections).min()?;
                let tied: Vec<&Candidate> =
                    candidates.iter().filter(|c| c.connections == min).collect();
                // Ties rotate through the same cursor.
                let index = self.cursor.fetch_add(1, Ordering::SeqCst) % tied.len();
                Some(tied[index].model_id.clone())
            }
        }
    }
}
