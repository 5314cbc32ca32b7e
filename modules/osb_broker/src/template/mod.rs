//! Template engine: source resolution and ordered rendering.

pub mod patch;
pub mod renderer;
pub mod resolver;

use serde_json::Value;

use crate::config::{BrokerConfig, Readiness};
use crate::registry::Entry;

pub use renderer::{render_named, render_template, run_parameter_list, RenderedTemplate};

/// Everything a render pass needs: the active configuration (for snippet
/// lookups), the entity's registry entry, and the caller's parameter
/// document. `use_defaults` is cleared on the update path so absent request
/// parameters do not reintroduce defaults.
pub struct RenderContext<'a> {
    pub config: &'a BrokerConfig,
    pub entry: &'a mut Entry,
    pub parameters: &'a Value,
    pub use_defaults: bool,
}

impl<'a> RenderContext<'a> {
    pub fn new(config: &'a BrokerConfig, entry: &'a mut Entry, parameters: &'a Value) -> Self {
        Self {
            config,
            entry,
            parameters,
            use_defaults: true,
        }
    }
}

/// Evaluate a readiness predicate against an existing object.
pub fn readiness_matches(readiness: &Readiness, object: &Value) -> bool {
    let Ok(pointer) = jsonptr::Pointer::parse(&readiness.path) else {
        return false;
    };
    match pointer.resolve(object) {
        Ok(found) => match &readiness.value {
            Some(expected) => found == expected,
            None => true,
        },
        Err(_) => false,
    }
}
