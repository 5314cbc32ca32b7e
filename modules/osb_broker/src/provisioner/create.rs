//! Creation flow for service instances and service bindings.

use serde_json::Value;
use std::sync::Arc;

use super::{attach_owner, set_annotation, set_namespace, CANONICAL_ANNOTATION};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::platform::{object_ref, OwnerRef, Platform};
use crate::registry::{keys, Entry};
use crate::template::{
    readiness_matches, render_named, run_parameter_list, RenderContext, RenderedTemplate,
};

/// Which template list of the configuration binding drives this creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionScope {
    Instance,
    Binding,
}

pub struct CreateProvisioner {
    platform: Arc<dyn Platform>,
    config: Arc<BrokerConfig>,
    entry: Entry,
    namespace: String,
    scope: ProvisionScope,
    rendered: Vec<RenderedTemplate>,
}

impl CreateProvisioner {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: Arc<BrokerConfig>,
        entry: Entry,
        namespace: String,
        scope: ProvisionScope,
    ) -> Self {
        Self {
            platform,
            config,
            entry,
            namespace,
            scope,
            rendered: Vec::new(),
        }
    }

    pub fn entry_mut(&mut self) -> &mut Entry {
        &mut self.entry
    }

    /// Synchronous phase: resolve the pre-render parameter list (registry
    /// writes) and render every template in declared order, caching the
    /// bodies for the asynchronous phase.
    pub fn prepare(&mut self, parameters: &Value) -> Result<(), BrokerError> {
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

        let list = match self.scope {
            ProvisionScope::Instance => binding.service_instance.clone(),
            ProvisionScope::Binding => binding.service_binding.clone(),
        };
        let Some(list) = list else {
            return Ok(());
        };

        let mut rendered = Vec::with_capacity(list.templates.len());
        {
            let mut ctx = RenderContext::new(self.config.as_ref(), &mut self.entry, parameters);
            run_parameter_list(&mut ctx, &list.parameters)?;
            for name in &list.templates {
                rendered.push(render_named(&mut ctx, name)?);
            }
        }
        self.rendered = rendered;
        Ok(())
    }

    /// Asynchronous phase: decorate each cached body and apply it through
    /// the platform's create interface.
    pub async fn run(self) -> Result<(), BrokerError> {
        let owner = self
            .entry
            .owner_reference()
            .ok_or_else(|| BrokerError::internal("registry entry has no owner reference"))?;

        for rendered in &self.rendered {
            let canonical = serde_json::to_string(&rendered.body).map_err(|e| {
                BrokerError::internal(format!("failed to encode canonical body: {e}"))
            })?;

            let mut object = rendered.body.clone();
            set_namespace(&mut object, &self.namespace)?;
            attach_owner(&mut object, &owner)?;
            set_annotation(&mut object, CANONICAL_ANNOTATION, canonical)?;

            match self.platform.create(&self.namespace, &object).await {
                Ok(_) => {}
                Err(err) if err.is_already_exists() => {
                    self.recover_existing(rendered, &object, &owner).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// `AlreadyExists` recovery: singletons adopt the existing object by
    /// appending our owner reference; otherwise an object that satisfies the
    /// template's readiness predicate is treated as an idempotent re-create.
    /// Anything else is fatal for this entity.
    async fn recover_existing(
        &self,
        rendered: &RenderedTemplate,
        object: &Value,
        owner: &OwnerRef,
    ) -> Result<(), BrokerError> {
        let reference = object_ref(&self.namespace, object)?;

        if rendered.singleton {
            let mut existing = self.platform.get(&reference).await?;
            attach_owner(&mut existing, owner)?;
            self.platform.update(&self.namespace, &existing).await?;
            return Ok(());
        }

        if let Some(readiness) = &rendered.readiness {
            let existing = self.platform.get(&reference).await?;
            if readiness_matches(readiness, &existing) {
                return Ok(());
            }
        }

        Err(BrokerError::conflict(format!(
            "resource {reference} already exists"
        )))
    }
}
