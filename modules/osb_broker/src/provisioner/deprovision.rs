//! Deprovisioning flow for instances and bindings.
//!
//! The broker only deletes the registry entry; the platform reaps every
//! owner-referenced resource created under it.

use crate::error::BrokerError;
use crate::registry::Entry;

pub struct DeprovisionProvisioner {
    entry: Entry,
}

impl DeprovisionProvisioner {
    pub fn new(entry: Entry) -> Self {
        Self { entry }
    }

    pub fn entry_mut(&mut self) -> &mut Entry {
        &mut self.entry
    }

    pub async fn run(mut self) -> Result<(), BrokerError> {
        self.entry.delete().await
    }
}
