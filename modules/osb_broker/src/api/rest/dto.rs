//! Wire DTOs for the OSB endpoints.
//!
//! Request bodies are parsed manually from bytes so malformed JSON surfaces
//! as a `ParameterError` in the OSB error shape rather than a framework
//! rejection. Unknown fields are tolerated per the OSB spec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServiceInstanceRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub organization_guid: Option<String>,
    #[serde(default)]
    pub space_guid: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateServiceInstanceRequest {
    pub service_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub previous_values: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServiceBindingRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub bind_resource: Option<Value>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Query strings for the mutating endpoints. `accepts_incomplete` stays a
/// string so a malformed value maps to the OSB error shape instead of an
/// extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MutatingQuery {
    #[serde(default)]
    pub accepts_incomplete: Option<String>,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

/// Query strings for the read endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

/// Query strings for the polling endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastOperationQuery {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetInstanceResponse {
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetBindingResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastOperationResponse {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
