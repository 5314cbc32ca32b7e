//! Holder for the active configuration document.
//!
//! Readers pin a snapshot `Arc` for the whole request, so a concurrent
//! `replace` can never expose a half-swapped document.

use arc_swap::ArcSwapOption;
use std::sync::Arc;

use super::{validate, BrokerConfig, ConfigError};

#[derive(Default)]
pub struct ConfigStore {
    active: ArcSwapOption<BrokerConfig>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic read of the active document; `None` until the first successful
    /// `replace`.
    pub fn current(&self) -> Option<Arc<BrokerConfig>> {
        self.active.load_full()
    }

    /// Validate and atomically swap in a new document. On failure the old
    /// document stays active.
    pub fn replace(&self, config: BrokerConfig) -> Result<(), ConfigError> {
        validate(&config)?;
        self.active.store(Some(Arc::new(config)));
        Ok(())
    }

    /// Drop the active document; the broker reports not-ready until the next
    /// successful `replace`.
    pub fn clear(&self) {
        self.active.store(None);
    }

    pub fn is_ready(&self) -> bool {
        self.active.load().is_some()
    }
}
