//! Model registry - backend registration and discovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::types::BackendId;

// =============================================================================
// Capabilities
// =============================================================================

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    CodeGeneration,
    Reasoning,
    Vision,
    LongContext,
    FunctionCalling,
}

// =============================================================================
// Backend profile
// =============================================================================

/// A registered backend and its static characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    pub id: BackendId,
    pub capabilities: BTreeSet<Capability>,
    pub cost_per_1k_tokens_cents: f64,
    pub avg_latency_ms: u64,
    pub max_context_tokens: u64,
    pub healthy: bool,
    pub last_health_check: DateTime<Utc>,
}

impl BackendProfile {
    pub fn new(id: BackendId, cost_per_1k_tokens_cents: f64, avg_latency_ms: u64) -> Self {
        Self {
            id,
            capabilities: BTreeSet::from([Capability::TextGeneration]),
            cost_per_1k_tokens_cents,
            avg_latency_ms,
            max_context_tokens: 128_000,
            healthy: true,
            last_health_check: Utc::now(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn with_max_context(mut self, tokens: u64) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    /// Whether every required capability is present.
    pub fn supports(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn estimate_cost_cents(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens_cents
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registered backends by id.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    backends: HashMap<BackendId, BackendProfile>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id is already registered.
    pub fn register(&mut self, profile: BackendProfile) -> bool {
        if self.backends.contains_key(&profile.id) {
            return false;
        }
        tracing::debug!(backend = %profile.id, "backend_registered");
        self.backends.insert(profile.id.clone(), profile);
        true
    }

    pub fn unregister(&mut self, id: &BackendId) -> bool {
        self.backends.remove(id).is_some()
    }

    pub fn get(&self, id: &BackendId) -> Option<&BackendProfile> {
        self.backends.get(id)
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.backends.contains_key(id)
    }

    /// Flip the registry health flag. Returns false for unknown ids.
    pub fn set_healthy(&mut self, id: &BackendId, healthy: bool) -> bool {
        match self.backends.get_mut(id) {
            Some(profile) => {
                if profile.healthy != healthy {
                    tracing::info!(backend = %id, healthy, "backend_health_changed");
                }
                profile.healthy = healthy;
                profile.last_health_check = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Healthy backends, sorted by id.
    pub fn list_healthy(&self) -> Vec<&BackendProfile> {
        let mut healthy: Vec<_> = self.backends.values().filter(|p| p.healthy).collect();
        healthy.sort_by(|a, b| a.id.cmp(&b.id));
        healthy
    }

    /// All backends, sorted by id.
    pub fn list_all(&self) -> Vec<&BackendProfile> {
        let mut all: Vec<_> = self.backends.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> BackendId {
        BackendId::must(s)
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut reg = ModelRegistry::new();
        assert!(reg.register(BackendProfile::new(id("a"), 1.0, 100)));
        assert!(!reg.register(BackendProfile::new(id("a"), 2.0, 100)));
        assert_eq!(reg.get(&id("a")).unwrap().cost_per_1k_tokens_cents, 1.0);
        assert!(reg.unregister(&id("a")));
        assert!(!reg.unregister(&id("a")));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_list_healthy_respects_flag() {
        let mut reg = ModelRegistry::new();
        reg.register(BackendProfile::new(id("b"), 1.0, 100));
        reg.register(BackendProfile::new(id("a"), 1.0, 100));
        assert!(reg.set_healthy(&id("b"), false));
        assert!(!reg.set_healthy(&id("missing"), false));

        let healthy: Vec<_> = reg.list_healthy().iter().map(|p| p.id.clone()).collect();
        assert_eq!(healthy, vec![id("a")]);
        assert_eq!(reg.list_all().len(), 2);
    }

    #[test]
    fn test_capability_support() {
        let profile = BackendProfile::new(id("coder"), 1.0, 100)
            .with_capabilities([Capability::CodeGeneration, Capability::Reasoning]);
        assert!(profile.supports(&[Capability::CodeGeneration]));
        assert!(profile.supports(&[]));
        assert!(!profile.supports(&[Capability::Vision]));
        assert_eq!(profile.estimate_cost_cents(2_000), 2.0);
    }
}
