//! Ordered template rendering.
//!
//! The configuration is never mutated: every render works on a deep copy of
//! the template body. Parameters run in declared order, destinations in
//! declared order within each parameter.

use serde_json::Value;

use super::{patch, resolver, RenderContext};
use crate::config::{Destination, ParameterSpec, Readiness, Template};
use crate::error::BrokerError;

/// A template after parameter application, ready for the provisioner.
#[derive(Debug, Clone)]
pub struct RenderedTemplate {
    pub name: String,
    pub body: Value,
    pub singleton: bool,
    pub readiness: Option<Readiness>,
}

/// Render a template against the context's entry and caller parameters.
pub fn render_template(
    ctx: &mut RenderContext<'_>,
    template: &Template,
) -> Result<RenderedTemplate, BrokerError> {
    let mut body = template.template.clone();

    for spec in &template.parameters {
        let value = resolver::resolve_parameter(ctx, spec)?;
        if value.is_null() {
            // Unresolved optional parameter: skip all destinations silently.
            continue;
        }
        for destination in &spec.destinations {
            match destination {
                Destination::Registry { key } => {
                    let raw = registry_value(&value);
                    ctx.entry
                        .set_user(key, raw)
                        .map_err(|e| e.for_parameter(&spec.name))?;
                }
                Destination::Path { pointer } => {
                    patch::apply_add(&mut body, pointer, value.clone())
                        .map_err(|e| e.for_parameter(&spec.name))?;
                }
            }
        }
    }

    Ok(RenderedTemplate {
        name: template.name.clone(),
        body,
        singleton: template.singleton,
        readiness: template.readiness.clone(),
    })
}

/// Render a template by name; used by snippet resolution and provisioners.
pub fn render_named(
    ctx: &mut RenderContext<'_>,
    name: &str,
) -> Result<RenderedTemplate, BrokerError> {
    let template = ctx
        .config
        .template(name)
        .cloned()
        .ok_or_else(|| BrokerError::configuration(format!("unknown template {name:?}")))?;
    render_template(ctx, &template)
}

/// Run a template list's pre-render parameters. These have no template
/// context, so only registry destinations are legal.
pub fn run_parameter_list(
    ctx: &mut RenderContext<'_>,
    specs: &[ParameterSpec],
) -> Result<(), BrokerError> {
    for spec in specs {
        let value = resolver::resolve_parameter(ctx, spec)?;
        if value.is_null() {
            continue;
        }
        for destination in &spec.destinations {
            match destination {
                Destination::Registry { key } => {
                    let raw = registry_value(&value);
                    ctx.entry
                        .set_user(key, raw)
                        .map_err(|e| e.for_parameter(&spec.name))?;
                }
                Destination::Path { .. } => {
                    return Err(BrokerError::configuration(format!(
                        "parameter {:?}: path destinations require a template context",
                        spec.name
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Registry values are strings; non-strings are committed JSON-encoded.
fn registry_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
