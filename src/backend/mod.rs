//! Strategy backends and funds rails.
//!
//! - `traits`: the [`StrategyCapability`] contract every backend implements
//! - `call`: timeout-bounded typed call outcomes and scatter/gather
//! - `mock`: simulated backend with failure injection
//! - `rails`: funds source/sink for the vault's liquid buffer

mod call;
pub mod mock;
mod rails;
mod traits;

pub use call::{guarded, scatter, CallOutcome, CallTarget};
pub use mock::MockStrategy;
pub use rails::{FundsRail, LiquidBuffer};
pub use traits::{BackendMetrics, StrategyCapability};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Adapters keyed by the backend reference stored on each strategy record.
#[derive(Clone, Default)]
pub struct BackendSet {
    adapters: BTreeMap<String, Arc<dyn StrategyCapability>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `key`, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, adapter: Arc<dyn StrategyCapability>) {
        self.adapters.insert(key.into(), adapter);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn StrategyCapability>> {
        self.adapters.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.adapters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
