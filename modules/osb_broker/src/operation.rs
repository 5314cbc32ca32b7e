//! Asynchronous operation lifecycle.
//!
//! At most one operation is in flight per entity. The durable half (operation
//! kind and id) lives in the registry entry; the completion signal is a
//! process-local one-shot. Polling drains the signal exactly once and records
//! the terminal status back into the registry.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::registry::{keys, Entry, EntryKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Provision,
    Update,
    Deprovision,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Update => "update",
            Self::Deprovision => "deprovision",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "provision" => Some(Self::Provision),
            "update" => Some(Self::Update),
            "deprovision" => Some(Self::Deprovision),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal or in-flight status reported to the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed(String),
}

/// Completion payload: `None` on success, the error message on failure.
type Completion = Option<String>;

enum Slot {
    Pending {
        kind: OperationKind,
        receiver: oneshot::Receiver<Completion>,
    },
    Drained(OperationStatus),
}

type Key = (EntryKind, String);

#[derive(Default)]
pub struct OperationTable {
    inner: DashMap<Key, Arc<Mutex<Slot>>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self, kind: EntryKind, id: &str) -> bool {
        self.inner.contains_key(&(kind, id.to_string()))
    }

    /// Start a new operation for the entry: persist the durable bookkeeping,
    /// allocate the completion signal, and hand the sender to the caller for
    /// dispatch. Rejects when an operation is already in flight.
    pub async fn begin(
        &self,
        entry: &mut Entry,
        kind: OperationKind,
    ) -> Result<(Uuid, oneshot::Sender<Completion>), BrokerError> {
        let key = (entry.kind(), entry.id().to_string());
        if self.inner.contains_key(&key) {
            return Err(BrokerError::concurrency(format!(
                "an operation is already in progress for {} {}",
                entry.kind().describe(),
                entry.id()
            )));
        }

        let id = Uuid::new_v4();
        entry.set(keys::OPERATION, kind.as_str());
        entry.set(keys::OPERATION_ID, id.to_string());
        entry.unset(keys::OPERATION_STATUS);
        entry.commit().await?;

        let (sender, receiver) = oneshot::channel();
        self.inner
            .insert(key, Arc::new(Mutex::new(Slot::Pending { kind, receiver })));
        Ok((id, sender))
    }

    /// Non-blocking poll. When the signal is ready the terminal status is
    /// persisted, the bookkeeping keys are unset and the in-memory entry is
    /// removed; concurrent pollers serialize on the per-entity lock and see
    /// a consistent answer. With nothing in flight, a persisted failure is
    /// reported and anything else counts as success.
    pub async fn drain(&self, entry: &mut Entry) -> Result<OperationStatus, BrokerError> {
        let key = (entry.kind(), entry.id().to_string());
        let Some(slot) = self.inner.get(&key).map(|s| Arc::clone(s.value())) else {
            return Ok(match entry.get(keys::OPERATION_STATUS) {
                Some(message) if !message.is_empty() => {
                    OperationStatus::Failed(message.to_string())
                }
                _ => OperationStatus::Succeeded,
            });
        };

        let mut slot = slot.lock().await;
        match &mut *slot {
            Slot::Drained(status) => Ok(status.clone()),
            Slot::Pending { kind, receiver } => {
                let kind = *kind;
                let completion = match receiver.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => {
                        return Ok(OperationStatus::InProgress)
                    }
                    Ok(completion) => completion,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        Some("operation abandoned by the broker".to_string())
                    }
                };

                let status = match completion {
                    None => OperationStatus::Succeeded,
                    Some(message) => OperationStatus::Failed(message),
                };

                entry.unset(keys::OPERATION);
                entry.unset(keys::OPERATION_ID);
                match &status {
                    OperationStatus::Failed(message) => {
                        entry.set(keys::OPERATION_STATUS, message.clone())
                    }
                    _ => entry.unset(keys::OPERATION_STATUS),
                }
                // A completed deprovision deleted the backing record; a commit
                // here would resurrect it. Everything else persists the
                // terminal status.
                let deprovisioned =
                    kind == OperationKind::Deprovision && status == OperationStatus::Succeeded;
                if entry.is_persisted() && !deprovisioned {
                    entry.commit().await?;
                }

                *slot = Slot::Drained(status.clone());
                self.inner.remove(&key);
                Ok(status)
            }
        }
    }
}

/// Run the async phase on a background task, honoring the plan's maximum
/// polling duration, and deliver the outcome into the completion signal
/// exactly once.
pub fn dispatch<F>(sender: oneshot::Sender<Completion>, window: Option<Duration>, task: F)
where
    F: Future<Output = Result<(), BrokerError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match window {
            Some(window) => match tokio::time::timeout(window, task).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::internal(format!(
                    "operation exceeded the maximum polling duration of {}s",
                    window.as_secs()
                ))),
            },
            None => task.await,
        };
        if let Err(error) = &result {
            tracing::warn!(%error, "asynchronous operation failed");
        }
        let _ = sender.send(result.err().map(|e| e.to_string()));
    });
}
