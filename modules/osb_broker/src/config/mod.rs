//! Broker configuration document: service catalog, named resource templates
//! and the bindings that tie a (service, plan) pair to them.
//!
//! The document deserializes from YAML or JSON. Tagged unions carry the
//! single-variant invariant structurally: a source or destination with more
//! than one variant key fails deserialization outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub mod store;
pub mod validate;

pub use store::ConfigStore;
pub use validate::{validate, ConfigError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub catalog: Catalog,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub bindings: Vec<ConfigBinding>,
}

/// The catalog is served verbatim at `/v2/catalog`; field names follow the
/// OSBAPI wire shape (including the `plan_updateable` spelling).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    pub services: Vec<ServiceOffering>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub bindable: bool,
    #[serde(rename = "plan_updateable", default)]
    pub plan_updatable: bool,
    pub plans: Vec<ServicePlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    /// Seconds the platform may keep polling before the broker fails the
    /// operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_polling_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Schemas>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<InstanceSchemas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<BindingSchemas>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingSchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputParametersSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// A named, parameterized resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    pub name: String,
    /// Raw resource body the parameters patch into.
    #[serde(default)]
    pub template: Value,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Shared across instances; `AlreadyExists` on create appends our owner
    /// reference instead of failing.
    #[serde(default)]
    pub singleton: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
}

/// Predicate over an existing object that decides whether a non-singleton
/// re-create collision is safe to treat as idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Readiness {
    /// JSON pointer into the object.
    pub path: String,
    /// Expected literal; when absent, presence of the path suffices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    /// Diagnostic name; errors are attributed to it.
    pub name: String,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// How a parameter value is obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Read a key from this entry's registry.
    Registry { key: String },
    /// JSON-pointer lookup into the caller's parameter document.
    Parameter { pointer: String },
    /// Printf-style expansion over resolved inner sources.
    Format { format: String, args: Vec<Source> },
    GeneratePassword {
        length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dictionary: Option<String>,
    },
    GenerateKey {
        #[serde(rename = "type")]
        key_type: KeyType,
        encoding: KeyEncoding,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bits: Option<usize>,
    },
    GenerateCertificate {
        /// Source resolving to the PEM private key the certificate is for.
        key: Box<Source>,
        common_name: String,
        #[serde(with = "humantime_serde")]
        lifetime: Duration,
        usage: CertificateUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sans: Option<SubjectAltNames>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ca: Option<CertificateAuthority>,
    },
    /// Recursively render a named template and inject its body.
    Snippet { template: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    P224,
    P256,
    P384,
    P521,
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    Pkcs1,
    Pkcs8,
    Sec1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateUsage {
    Ca,
    Server,
    Client,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubjectAltNames {
    #[serde(default)]
    pub dns: Vec<Source>,
    #[serde(default)]
    pub email: Vec<Source>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateAuthority {
    pub key: Box<Source>,
    pub certificate: Box<Source>,
}

/// Typed literal used when a source resolves to nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    String(String),
    Json(Value),
}

impl DefaultValue {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::String(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

/// Where a resolved value lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// Commit to this entry's registry under `key`.
    Registry { key: String },
    /// Patch into the template body at this JSON pointer.
    Path { pointer: String },
}

/// Ties a cataloged (service, plan) pair to the template lists executed on
/// instance provisioning and binding creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigBinding {
    pub name: String,
    pub service: String,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<TemplateList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<TemplateList>,
}

/// Pre-render parameters (registry writes only) plus templates rendered in
/// declared order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateList {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub templates: Vec<String>,
}

impl TemplateList {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.templates.is_empty()
    }
}

impl BrokerConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Malformed {
            message: e.to_string(),
        })
    }

    pub fn offering(&self, service_id: &str) -> Option<&ServiceOffering> {
        self.catalog.services.iter().find(|s| s.id == service_id)
    }

    pub fn plan(&self, service_id: &str, plan_id: &str) -> Option<(&ServiceOffering, &ServicePlan)> {
        let offering = self.offering(service_id)?;
        let plan = offering.plans.iter().find(|p| p.id == plan_id)?;
        Some((offering, plan))
    }

    pub fn offering_by_name(&self, name: &str) -> Option<&ServiceOffering> {
        self.catalog.services.iter().find(|s| s.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn binding_for(&self, service_name: &str, plan_name: &str) -> Option<&ConfigBinding> {
        self.bindings
            .iter()
            .find(|b| b.service == service_name && b.plan == plan_name)
    }

    /// Resolve a request's `(service_id, plan_id)` pair to the offering,
    /// plan and configuration binding that govern it.
    pub fn binding_for_ids(
        &self,
        service_id: &str,
        plan_id: &str,
    ) -> Option<(&ServiceOffering, &ServicePlan, &ConfigBinding)> {
        let (offering, plan) = self.plan(service_id, plan_id)?;
        let binding = self.binding_for(&offering.name, &plan.name)?;
        Some((offering, plan, binding))
    }
}

impl ServiceOffering {
    /// Plan-level bindability falls back to the offering flag.
    pub fn plan_bindable(&self, plan: &ServicePlan) -> bool {
        plan.bindable.unwrap_or(self.bindable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
catalog:
  services:
    - id: dd2cce49-3813-4923-8f3c-6fc7d5e4343e
      name: ponies
      description: Ponies as a service
      bindable: true
      plan_updateable: true
      plans:
        - id: 3f525c60-bd66-4f91-8967-113e9c053d05
          name: stable
          description: A stable pony
          schemas:
            service_instance:
              create:
                parameters:
                  type: object
templates:
  - name: pony-config
    singleton: false
    template:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: pony
    parameters:
      - name: animal
        source:
          parameter:
            pointer: /animal
        default: pony
        destinations:
          - path:
              pointer: /data/animal
bindings:
  - name: stable-ponies
    service: ponies
    plan: stable
    service_instance:
      parameters:
        - name: password
          source:
            generate_password:
              length: 32
          destinations:
            - registry:
                key: password
      templates:
        - pony-config
    service_binding:
      parameters:
        - name: credentials
          source:
            format:
              format: "{\"password\":\"%s\"}"
              args:
                - registry:
                    key: password
          destinations:
            - registry:
                key: credentials
"#;

    #[test]
    fn document_parses_and_lookups_resolve() {
        let config = BrokerConfig::from_yaml(DOC).unwrap();

        let offering = config
            .offering("dd2cce49-3813-4923-8f3c-6fc7d5e4343e")
            .unwrap();
        assert_eq!(offering.name, "ponies");
        assert!(offering.plan_updatable);

        let (offering, plan, binding) = config
            .binding_for_ids(
                "dd2cce49-3813-4923-8f3c-6fc7d5e4343e",
                "3f525c60-bd66-4f91-8967-113e9c053d05",
            )
            .unwrap();
        assert_eq!(plan.name, "stable");
        assert_eq!(binding.name, "stable-ponies");
        assert!(offering.plan_bindable(plan));

        let template = config.template("pony-config").unwrap();
        assert_eq!(template.parameters.len(), 1);
        assert!(matches!(
            template.parameters[0].source,
            Source::Parameter { .. }
        ));
    }

    #[test]
    fn default_literal_forms() {
        let s: DefaultValue = serde_yaml::from_str("pony").unwrap();
        assert_eq!(s.to_value(), Value::String("pony".to_string()));

        let b: DefaultValue = serde_yaml::from_str("true").unwrap();
        assert_eq!(b.to_value(), Value::Bool(true));

        let i: DefaultValue = serde_yaml::from_str("42").unwrap();
        assert_eq!(i.to_value(), Value::from(42));

        let j: DefaultValue = serde_yaml::from_str("{a: [1, 2]}").unwrap();
        assert_eq!(j.to_value(), serde_json::json!({"a": [1, 2]}));
    }

    #[test]
    fn source_with_two_variant_keys_is_rejected() {
        let raw = r#"
name: broken
source:
  registry:
    key: a
  parameter:
    pointer: /b
"#;
        let result: Result<ParameterSpec, _> = serde_yaml::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn generate_key_shape() {
        let raw = r#"
name: key
source:
  generate_key:
    type: rsa
    encoding: pkcs1
    bits: 2048
"#;
        let spec: ParameterSpec = serde_yaml::from_str(raw).unwrap();
        match spec.source {
            Source::GenerateKey {
                key_type,
                encoding,
                bits,
            } => {
                assert_eq!(key_type, KeyType::Rsa);
                assert_eq!(encoding, KeyEncoding::Pkcs1);
                assert_eq!(bits, Some(2048));
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn generate_certificate_shape() {
        let raw = r#"
name: cert
source:
  generate_certificate:
    key:
      registry:
        key: server-key
    common_name: example.com
    lifetime: 720h
    usage: server
    sans:
      dns:
        - parameter:
            pointer: /hostname
    ca:
      key:
        registry:
          key: ca-key
      certificate:
        registry:
          key: ca-cert
"#;
        let spec: ParameterSpec = serde_yaml::from_str(raw).unwrap();
        match spec.source {
            Source::GenerateCertificate {
                usage,
                lifetime,
                sans,
                ca,
                ..
            } => {
                assert_eq!(usage, CertificateUsage::Server);
                assert_eq!(lifetime, Duration::from_secs(720 * 3600));
                assert_eq!(sans.unwrap().dns.len(), 1);
                assert!(ca.is_some());
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn catalog_round_trips_verbatim() {
        let config = BrokerConfig::from_yaml(DOC).unwrap();
        let json = serde_json::to_value(&config.catalog).unwrap();
        assert_eq!(
            json["services"][0]["id"],
            "dd2cce49-3813-4923-8f3c-6fc7d5e4343e"
        );
        assert_eq!(json["services"][0]["plan_updateable"], true);
    }
}
