use std::collections::HashMap;
use std::sync::RwLock;

use rand::Rng;
use serde_json::Value;

/// Suite-scoped shared store for passing values between scenarios.
///
/// Variables are last-write-wins; pools are append-only lists sampled
/// uniformly. There are no transactional guarantees between concurrent
/// producers and consumers — readers must tolerate missing keys.
pub struct CorrelationContext {
    variables: RwLock<HashMap<String, Value>>,
    pools: RwLock<HashMap<String, Vec<Value>>>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self {
            variables: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        self.variables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.variables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn add_to_pool(&self, key: &str, value: Value) {
        self.pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.to_string())
            .or_default()
            .push(value);
    }

    /// A uniformly-sampled element of the pool, or `None` when the pool is
    /// missing or empty.
    pub fn random_from_pool(&self, key: &str) -> Option<Value> {
        let pools = self
            .pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pool = pools.get(key)?;
        if pool.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..pool.len());
        Some(pool[index].clone())
    }

    pub fn pool_len(&self, key: &str) -> usize {
        self.pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
