//! Structural validation of the broker configuration document.
//!
//! All rules run before a document is allowed to become active; a violation
//! leaves the previous document in place.

use thiserror::Error;

use super::{
    BrokerConfig, ConfigBinding, Destination, KeyEncoding, KeyType, ParameterSpec, Source,
    TemplateList,
};
use crate::error::BrokerError;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {message}")]
    Malformed { message: String },

    #[error("binding {binding:?}: unknown service offering {service:?}")]
    UnknownService { binding: String, service: String },

    #[error("binding {binding:?}: service {service:?} has no plan {plan:?}")]
    UnknownPlan {
        binding: String,
        service: String,
        plan: String,
    },

    #[error("service {service:?} plan {plan:?} is referenced by more than one binding")]
    DuplicateBinding { service: String, plan: String },

    #[error("binding {binding:?}: plan is not bindable but declares service_binding templates")]
    UnbindablePlanHasTemplates { binding: String },

    #[error("binding {binding:?}: plan is bindable but declares no service_binding templates")]
    BindablePlanMissingTemplates { binding: String },

    #[error("binding {binding:?}: {list} template list is empty")]
    EmptyTemplateList { binding: String, list: String },

    #[error("{referent}: unknown template {template:?}")]
    UnknownTemplate { referent: String, template: String },

    #[error("template snippet cycle: {chain}")]
    SnippetCycle { chain: String },

    #[error(
        "binding {binding:?}: parameter {parameter:?} writes to a path destination outside a template"
    )]
    PathOutsideTemplate { binding: String, parameter: String },

    #[error("parameter {parameter:?}: invalid JSON pointer {pointer:?}: {message}")]
    InvalidPointer {
        parameter: String,
        pointer: String,
        message: String,
    },

    #[error("parameter {parameter:?}: {message}")]
    InvalidGenerator { parameter: String, message: String },
}

impl From<ConfigError> for BrokerError {
    fn from(err: ConfigError) -> Self {
        BrokerError::Configuration(err.to_string())
    }
}

/// Validate a parsed document against all structural rules.
pub fn validate(config: &BrokerConfig) -> Result<(), ConfigError> {
    validate_bindings(config)?;
    validate_templates(config)?;
    validate_cycles(config)?;
    Ok(())
}

fn validate_bindings(config: &BrokerConfig) -> Result<(), ConfigError> {
    let mut seen_pairs = std::collections::HashSet::new();

    for binding in &config.bindings {
        let offering = config.offering_by_name(&binding.service).ok_or_else(|| {
            ConfigError::UnknownService {
                binding: binding.name.clone(),
                service: binding.service.clone(),
            }
        })?;
        let plan = offering
            .plans
            .iter()
            .find(|p| p.name == binding.plan)
            .ok_or_else(|| ConfigError::UnknownPlan {
                binding: binding.name.clone(),
                service: binding.service.clone(),
                plan: binding.plan.clone(),
            })?;

        if !seen_pairs.insert((binding.service.clone(), binding.plan.clone())) {
            return Err(ConfigError::DuplicateBinding {
                service: binding.service.clone(),
                plan: binding.plan.clone(),
            });
        }

        // Bindability must agree with the presence of binding templates.
        let bindable = offering.plan_bindable(plan);
        match (&binding.service_binding, bindable) {
            (Some(_), false) => {
                return Err(ConfigError::UnbindablePlanHasTemplates {
                    binding: binding.name.clone(),
                })
            }
            (None, true) => {
                return Err(ConfigError::BindablePlanMissingTemplates {
                    binding: binding.name.clone(),
                })
            }
            _ => {}
        }

        for (list, label) in [
            (&binding.service_instance, "service_instance"),
            (&binding.service_binding, "service_binding"),
        ] {
            if let Some(list) = list {
                validate_template_list(config, binding, list, label)?;
            }
        }
    }
    Ok(())
}

fn validate_template_list(
    config: &BrokerConfig,
    binding: &ConfigBinding,
    list: &TemplateList,
    label: &str,
) -> Result<(), ConfigError> {
    if list.is_empty() {
        return Err(ConfigError::EmptyTemplateList {
            binding: binding.name.clone(),
            list: label.to_string(),
        });
    }

    for name in &list.templates {
        if config.template(name).is_none() {
            return Err(ConfigError::UnknownTemplate {
                referent: format!("binding {:?} {label} list", binding.name),
                template: name.clone(),
            });
        }
    }

    // Pre-render parameters have no template context; only registry
    // destinations make sense there.
    for spec in &list.parameters {
        validate_parameter(config, spec, &format!("binding {:?}", binding.name))?;
        if spec
            .destinations
            .iter()
            .any(|d| matches!(d, Destination::Path { .. }))
        {
            return Err(ConfigError::PathOutsideTemplate {
                binding: binding.name.clone(),
                parameter: spec.name.clone(),
            });
        }
    }
    Ok(())
}

fn validate_templates(config: &BrokerConfig) -> Result<(), ConfigError> {
    for template in &config.templates {
        for spec in &template.parameters {
            validate_parameter(config, spec, &format!("template {:?}", template.name))?;
        }
        if let Some(readiness) = &template.readiness {
            check_pointer(&template.name, &readiness.path)?;
        }
    }
    Ok(())
}

fn validate_parameter(
    config: &BrokerConfig,
    spec: &ParameterSpec,
    referent: &str,
) -> Result<(), ConfigError> {
    validate_source(config, &spec.name, &spec.source, referent)?;
    for destination in &spec.destinations {
        if let Destination::Path { pointer } = destination {
            check_pointer(&spec.name, pointer)?;
        }
    }
    Ok(())
}

fn validate_source(
    config: &BrokerConfig,
    parameter: &str,
    source: &Source,
    referent: &str,
) -> Result<(), ConfigError> {
    match source {
        Source::Registry { .. } => Ok(()),
        Source::Parameter { pointer } => check_pointer(parameter, pointer),
        Source::Format { args, .. } => {
            for arg in args {
                validate_source(config, parameter, arg, referent)?;
            }
            Ok(())
        }
        Source::GeneratePassword { length, dictionary } => {
            if *length == 0 {
                return Err(ConfigError::InvalidGenerator {
                    parameter: parameter.to_string(),
                    message: "password length must be non-zero".to_string(),
                });
            }
            if let Some(dictionary) = dictionary {
                if dictionary.is_empty() {
                    return Err(ConfigError::InvalidGenerator {
                        parameter: parameter.to_string(),
                        message: "password dictionary must be non-empty".to_string(),
                    });
                }
            }
            Ok(())
        }
        Source::GenerateKey {
            key_type,
            encoding,
            bits,
        } => check_key_spec(parameter, *key_type, *encoding, *bits),
        Source::GenerateCertificate { key, sans, ca, .. } => {
            validate_source(config, parameter, key, referent)?;
            if let Some(sans) = sans {
                for san in sans.dns.iter().chain(sans.email.iter()) {
                    validate_source(config, parameter, san, referent)?;
                }
            }
            if let Some(ca) = ca {
                validate_source(config, parameter, &ca.key, referent)?;
                validate_source(config, parameter, &ca.certificate, referent)?;
            }
            Ok(())
        }
        Source::Snippet { template } => {
            if config.template(template).is_none() {
                return Err(ConfigError::UnknownTemplate {
                    referent: format!("{referent} parameter {parameter:?}"),
                    template: template.clone(),
                });
            }
            Ok(())
        }
    }
}

/// The allowed `(type, encoding)` table; anything else is a configuration
/// error, as is a missing or superfluous `bits` field.
pub fn check_key_spec(
    parameter: &str,
    key_type: KeyType,
    encoding: KeyEncoding,
    bits: Option<usize>,
) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidGenerator {
        parameter: parameter.to_string(),
        message,
    };

    match key_type {
        KeyType::Rsa => {
            if bits.is_none() {
                return Err(invalid("RSA key generation requires bits".to_string()));
            }
            if !matches!(encoding, KeyEncoding::Pkcs1 | KeyEncoding::Pkcs8) {
                return Err(invalid(format!(
                    "RSA keys cannot be encoded as {encoding:?}"
                )));
            }
        }
        KeyType::P224 | KeyType::P256 | KeyType::P384 | KeyType::P521 => {
            if bits.is_some() {
                return Err(invalid(
                    "elliptic curve keys must not specify bits".to_string(),
                ));
            }
            if !matches!(encoding, KeyEncoding::Pkcs8 | KeyEncoding::Sec1) {
                return Err(invalid(format!(
                    "elliptic curve keys cannot be encoded as {encoding:?}"
                )));
            }
        }
        KeyType::Ed25519 => {
            if bits.is_some() {
                return Err(invalid("ed25519 keys must not specify bits".to_string()));
            }
            if encoding != KeyEncoding::Pkcs8 {
                return Err(invalid(format!(
                    "ed25519 keys cannot be encoded as {encoding:?}"
                )));
            }
        }
    }
    Ok(())
}

fn check_pointer(parameter: &str, pointer: &str) -> Result<(), ConfigError> {
    jsonptr::Pointer::parse(pointer)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidPointer {
            parameter: parameter.to_string(),
            pointer: pointer.to_string(),
            message: e.to_string(),
        })
}

/// Collect the template names a source references through snippets,
/// recursing through composite sources.
fn snippet_refs(source: &Source, out: &mut Vec<String>) {
    match source {
        Source::Snippet { template } => out.push(template.clone()),
        Source::Format { args, .. } => {
            for arg in args {
                snippet_refs(arg, out);
            }
        }
        Source::GenerateCertificate { key, sans, ca, .. } => {
            snippet_refs(key, out);
            if let Some(sans) = sans {
                for san in sans.dns.iter().chain(sans.email.iter()) {
                    snippet_refs(san, out);
                }
            }
            if let Some(ca) = ca {
                snippet_refs(&ca.key, out);
                snippet_refs(&ca.certificate, out);
            }
        }
        _ => {}
    }
}

/// DFS over the snippet graph from every template list and referenced
/// template; a repeated node on the current path is a cycle.
fn validate_cycles(config: &BrokerConfig) -> Result<(), ConfigError> {
    let mut roots = Vec::new();
    for binding in &config.bindings {
        for list in [&binding.service_instance, &binding.service_binding]
            .into_iter()
            .flatten()
        {
            for spec in &list.parameters {
                snippet_refs(&spec.source, &mut roots);
            }
            roots.extend(list.templates.iter().cloned());
        }
    }
    roots.extend(config.templates.iter().map(|t| t.name.clone()));

    for root in roots {
        let mut stack = Vec::new();
        visit(config, &root, &mut stack)?;
    }
    Ok(())
}

fn visit(config: &BrokerConfig, name: &str, stack: &mut Vec<String>) -> Result<(), ConfigError> {
    if let Some(pos) = stack.iter().position(|n| n == name) {
        let mut chain: Vec<&str> = stack[pos..].iter().map(String::as_str).collect();
        chain.push(name);
        return Err(ConfigError::SnippetCycle {
            chain: chain.join(" -> "),
        });
    }

    // Unknown templates are reported by reference validation, not here.
    let Some(template) = config.template(name) else {
        return Ok(());
    };

    stack.push(name.to_string());
    let mut refs = Vec::new();
    for spec in &template.parameters {
        snippet_refs(&spec.source, &mut refs);
    }
    for reference in refs {
        visit(config, &reference, stack)?;
    }
    stack.pop();
    Ok(())
}
