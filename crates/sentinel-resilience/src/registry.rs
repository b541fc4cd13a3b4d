//! Named collection of breakers for health monitoring.

use crate::breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared view over every breaker in the process.
///
/// Owners keep their own `Arc<CircuitBreaker>`; the registry only lets
/// the health monitor enumerate them.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: RwLock<Vec<Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a breaker and register it. A breaker with the same name is
    /// returned instead of creating a duplicate.
    pub fn create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write();
        if let Some(existing) = breakers.iter().find(|b| b.name() == name) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        breakers.push(breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().iter().map(|b| b.snapshot()).collect()
    }

    /// Names of breakers that are not CLOSED.
    pub fn unhealthy(&self) -> Vec<String> {
        self.breakers
            .read()
            .iter()
            .filter(|b| b.state() != BreakerState::Closed)
            .map(|b| b.name().to_string())
            .collect()
    }

    /// Operator reset of every breaker.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().iter() {
            breaker.reset();
        }
    }
}
