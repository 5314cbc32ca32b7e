//! Update flow for service instances.
//!
//! Singleton templates are never re-rendered: a per-instance update of shared
//! state would split-brain the other instances. Templates without parameters
//! cannot change, so they are skipped too.

use serde_json::Value;
use std::sync::Arc;

use super::{get_annotation, set_annotation, CANONICAL_ANNOTATION};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::platform::{object_ref, Platform};
use crate::registry::{keys, Entry};
use crate::template::{patch, render_template, RenderContext};

pub struct UpdateProvisioner {
    platform: Arc<dyn Platform>,
    config: Arc<BrokerConfig>,
    entry: Entry,
    namespace: String,
    updates: Vec<Value>,
}

impl UpdateProvisioner {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: Arc<BrokerConfig>,
        entry: Entry,
        namespace: String,
    ) -> Self {
        Self {
            platform,
            config,
            entry,
            namespace,
            updates: Vec::new(),
        }
    }

    pub fn entry_mut(&mut self) -> &mut Entry {
        &mut self.entry
    }

    /// Synchronous phase: re-render each eligible template with defaults
    /// disabled, diff the new body against the canonical annotation of the
    /// live object, and stage a merge-patched replacement when they differ.
    pub async fn prepare(&mut self, parameters: &Value) -> Result<(), BrokerError> {
        let service_id = self
            .entry
            .get(keys::SERVICE_ID)
            .ok_or_else(|| BrokerError::internal("registry entry has no service id"))?
            .to_string();
        let plan_id = self
            .entry
            .get(keys::PLAN_ID)
            .ok_or_else(|| BrokerError::internal("registry entry has no plan id"))?
            .to_string();

        let (_, _, binding) = self
            .config
            .binding_for_ids(&service_id, &plan_id)
            .ok_or_else(|| {
                BrokerError::configuration(format!(
                    "no configuration binding for service {service_id:?} plan {plan_id:?}"
                ))
            })?;

        let Some(list) = binding.service_instance.clone() else {
            return Ok(());
        };

        for name in &list.templates {
            let template = self
                .config
                .template(name)
                .cloned()
                .ok_or_else(|| BrokerError::configuration(format!("unknown template {name:?}")))?;
            if template.singleton || template.parameters.is_empty() {
                continue;
            }

            let rendered = {
                let mut ctx =
                    RenderContext::new(self.config.as_ref(), &mut self.entry, parameters);
                // Absent request parameters must not reintroduce defaults.
                ctx.use_defaults = false;
                render_template(&mut ctx, &template)?
            };

            let reference = object_ref(&self.namespace, &rendered.body)?;
            let current = self.platform.get(&reference).await?;

            let canonical = get_annotation(&current, CANONICAL_ANNOTATION).ok_or_else(|| {
                BrokerError::internal(format!(
                    "resource {reference} is missing its canonical annotation"
                ))
            })?;
            let original: Value = serde_json::from_str(canonical).map_err(|e| {
                BrokerError::internal(format!(
                    "resource {reference} has an unreadable canonical annotation: {e}"
                ))
            })?;

            if original == rendered.body {
                continue;
            }

            // Carry (original -> new) over to the live object so backend
            // mutations the broker never made survive the update.
            let merge = patch::merge_diff(&original, &rendered.body);
            let mut updated = current.clone();
            json_patch::merge(&mut updated, &merge);
            let canonical = serde_json::to_string(&rendered.body).map_err(|e| {
                BrokerError::internal(format!("failed to encode canonical body: {e}"))
            })?;
            set_annotation(&mut updated, CANONICAL_ANNOTATION, canonical)?;
            self.updates.push(updated);
        }
        Ok(())
    }

    /// Asynchronous phase: push the staged objects.
    pub async fn run(self) -> Result<(), BrokerError> {
        for object in &self.updates {
            self.platform.update(&self.namespace, object).await?;
        }
        Ok(())
    }
}
