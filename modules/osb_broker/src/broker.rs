//! Process-wide broker state, constructed once at startup and threaded
//! through the handlers as an `Arc`.

use std::sync::Arc;

use crate::config::{BrokerConfig, ConfigStore};
use crate::error::BrokerError;
use crate::operation::OperationTable;
use crate::platform::Platform;
use crate::registry::{Entry, EntryKind, EntryMode};

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Namespace for registry entries and for instances whose request
    /// context does not carry one.
    pub default_namespace: String,
    /// Expected bearer token; `None` disables authentication.
    pub token: Option<String>,
    /// Report 404 instead of `succeeded` when polling an entity with no
    /// in-flight operation.
    pub strict_polling: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            token: None,
            strict_polling: false,
        }
    }
}

pub struct Broker {
    pub settings: BrokerSettings,
    pub config: ConfigStore,
    pub operations: OperationTable,
    pub platform: Arc<dyn Platform>,
}

impl Broker {
    pub fn new(settings: BrokerSettings, platform: Arc<dyn Platform>) -> Self {
        Self {
            settings,
            config: ConfigStore::new(),
            operations: OperationTable::new(),
            platform,
        }
    }

    /// Pin the active configuration for the duration of a request.
    pub fn snapshot(&self) -> Result<Arc<BrokerConfig>, BrokerError> {
        self.config
            .current()
            .ok_or_else(|| BrokerError::configuration("broker configuration is not loaded"))
    }

    pub async fn open_entry(
        &self,
        kind: EntryKind,
        id: &str,
        mode: EntryMode,
    ) -> Result<Entry, BrokerError> {
        Entry::open(
            Arc::clone(&self.platform),
            &self.settings.default_namespace,
            kind,
            id,
            mode,
        )
        .await
    }
}
