use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pool::ConnectionRecord;

/// Load balancing strategy selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cycle through candidates in order
    #[default]
    #[serde(alias = "round_robin")]
    RoundRobin,
    /// Pick the candidate with the fewest recorded errors
    #[serde(alias = "least_connections")]
    LeastConnections,
    /// Random pick biased towards fast, error-free connections
    Weighted,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::Weighted => "weighted",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Strategy::RoundRobin),
            "least-connections" => Ok(Strategy::LeastConnections),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

/// Chooses among a pool's idle, healthy connections
///
/// The balancer holds no connections itself. The pool passes in the current
/// candidates, ordered by connection id, and gets back an index into that
/// slice.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,
    /// Cursor for round-robin
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Switch strategy, keeping the round-robin cursor
    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// Select a candidate using the configured strategy.
    /// Returns the index of the selected candidate
    pub fn select(&self, candidates: &[&ConnectionRecord]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(candidates.len()),
            Strategy::LeastConnections => Self::select_least_connections(candidates),
            Strategy::Weighted => {
                let draw = rand::thread_rng().gen::<f64>();
                Self::select_weighted(candidates, draw)
            }
        }
    }

    /// Round-robin: simple counter-based selection
    fn select_round_robin(&self, len: usize) -> Option<usize> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        Some(index)
    }

    /// Least-connections: the error count stands in for load, since idle
    /// candidates carry no in-flight work
    fn select_least_connections(candidates: &[&ConnectionRecord]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.error_count)
            .map(|(idx, _)| idx)
    }

    /// Weighted: `draw` in `[0, 1)` is scaled to the total weight, then the
    /// candidates are walked until it is used up
    fn select_weighted(candidates: &[&ConnectionRecord], draw: f64) -> Option<usize> {
        let weights: Vec<f64> = candidates.iter().map(|c| Self::weight(c)).collect();
        let total: f64 = weights.iter().sum();

        if total <= 0.0 {
            return Some(0);
        }

        let mut remaining = draw * total;
        for (idx, weight) in weights.iter().enumerate() {
            remaining -= weight;
            if remaining <= 0.0 {
                return Some(idx);
            }
        }

        // Float rounding left a sliver past the last weight
        Some(candidates.len() - 1)
    }

    /// `max(0, 100 - response_ms) + max(0, 10 - errors)`
    fn weight(candidate: &ConnectionRecord) -> f64 {
        let response_ms = candidate.last_response_time.as_secs_f64() * 1000.0;
        let latency = (100.0 - response_ms).max(0.0);
        let errors = (10.0 - f64::from(candidate.error_count)).max(0.0);
        latency + errors
    }
}

impl Clone for LoadBalancer {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy,
            counter: AtomicUsize::new(self.counter.load(Ordering::Relaxed)),
        }
    }
}
