//! Source resolution.
//!
//! Resolution is pure except for the entropy drawn by the generators. A
//! missing registry key or parameter pointer resolves to `Null`; the renderer
//! decides whether that is acceptable (default, skip, or required failure).

use serde_json::Value;

use super::{renderer, RenderContext};
use crate::config::{ParameterSpec, Source};
use crate::crypto::{self, CaMaterial, CertificateRequest};
use crate::error::BrokerError;

/// Resolve a parameter: source, then default, then the required check.
pub fn resolve_parameter(
    ctx: &mut RenderContext<'_>,
    spec: &ParameterSpec,
) -> Result<Value, BrokerError> {
    let mut value = resolve_source(ctx, &spec.source).map_err(|e| e.for_parameter(&spec.name))?;

    if value.is_null() && ctx.use_defaults {
        if let Some(default) = &spec.default {
            value = default.to_value();
        }
    }

    if value.is_null() && spec.required {
        return Err(BrokerError::parameter(format!(
            "parameter {:?} is required but resolved to no value",
            spec.name
        )));
    }

    Ok(value)
}

/// Resolve a single source into a structured value.
pub fn resolve_source(ctx: &mut RenderContext<'_>, source: &Source) -> Result<Value, BrokerError> {
    match source {
        Source::Registry { key } => Ok(ctx
            .entry
            .get_user(key)
            .map(|raw| Value::String(raw.to_string()))
            .unwrap_or(Value::Null)),

        Source::Parameter { pointer } => {
            let ptr = jsonptr::Pointer::parse(pointer).map_err(|e| {
                BrokerError::configuration(format!("invalid JSON pointer {pointer:?}: {e}"))
            })?;
            // A missing pointer is not an error; it propagates as absence.
            Ok(ptr
                .resolve(ctx.parameters)
                .map(|found| found.clone())
                .unwrap_or(Value::Null))
        }

        Source::Format { format, args } => {
            let mut resolved = Vec::with_capacity(args.len());
            for arg in args {
                let value = resolve_source(ctx, arg)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                resolved.push(value);
            }
            Ok(Value::String(expand_format(format, &resolved)?))
        }

        Source::GeneratePassword { length, dictionary } => Ok(Value::String(
            crypto::generate_password(*length, dictionary.as_deref())?,
        )),

        Source::GenerateKey {
            key_type,
            encoding,
            bits,
        } => Ok(Value::String(crypto::generate_key(
            *key_type, *encoding, *bits,
        )?)),

        Source::GenerateCertificate {
            key,
            common_name,
            lifetime,
            usage,
            sans,
            ca,
        } => {
            let key_pem = resolve_string(ctx, key, "certificate key")?;

            let mut dns_sans = Vec::new();
            let mut email_sans = Vec::new();
            if let Some(sans) = sans {
                for san in &sans.dns {
                    dns_sans.push(resolve_string(ctx, san, "DNS subject alternative name")?);
                }
                for san in &sans.email {
                    email_sans.push(resolve_string(ctx, san, "email subject alternative name")?);
                }
            }

            let ca_material = match ca {
                None => None,
                Some(ca) => Some((
                    resolve_string(ctx, &ca.key, "CA key")?,
                    resolve_string(ctx, &ca.certificate, "CA certificate")?,
                )),
            };

            let pem = crypto::generate_certificate(&CertificateRequest {
                key_pem: &key_pem,
                common_name,
                lifetime: *lifetime,
                usage: *usage,
                dns_sans,
                email_sans,
                ca: ca_material
                    .as_ref()
                    .map(|(key_pem, certificate_pem)| CaMaterial {
                        key_pem,
                        certificate_pem,
                    }),
            })?;
            Ok(Value::String(pem))
        }

        Source::Snippet { template } => {
            let template = ctx.config.template(template).cloned().ok_or_else(|| {
                BrokerError::configuration(format!("snippet references unknown template {template:?}"))
            })?;
            let rendered = renderer::render_template(ctx, &template)?;
            Ok(rendered.body)
        }
    }
}

/// Resolve a source that must produce a string; absence fails the whole call.
fn resolve_string(
    ctx: &mut RenderContext<'_>,
    source: &Source,
    what: &str,
) -> Result<String, BrokerError> {
    match resolve_source(ctx, source)? {
        Value::String(s) => Ok(s),
        Value::Null => Err(BrokerError::parameter(format!(
            "{what} resolved to no value"
        ))),
        other => Err(BrokerError::parameter(format!(
            "{what} must resolve to a string, got {other}"
        ))),
    }
}

/// Printf-style positional expansion. Supported verbs: `%s` and `%v` render
/// any value (non-strings as compact JSON), `%d` requires a number, `%%`
/// escapes a percent sign.
fn expand_format(template: &str, args: &[Value]) -> Result<String, BrokerError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    let mut index = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'v' | 'd')) => {
                let arg = args.get(index).ok_or_else(|| {
                    BrokerError::configuration(format!(
                        "format string {template:?} has more placeholders than arguments"
                    ))
                })?;
                index += 1;
                match verb {
                    'd' => match arg {
                        Value::Number(n) => out.push_str(&n.to_string()),
                        other => {
                            return Err(BrokerError::configuration(format!(
                                "%d requires a numeric argument, got {other}"
                            )))
                        }
                    },
                    _ => out.push_str(&display(arg)),
                }
            }
            other => {
                return Err(BrokerError::configuration(format!(
                    "unsupported format directive %{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }

    if index != args.len() {
        return Err(BrokerError::configuration(format!(
            "format string {template:?} has fewer placeholders than arguments"
        )));
    }
    Ok(out)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
