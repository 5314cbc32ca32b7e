//! OSB endpoint logic: request validation, idempotency/conflict checks,
//! operation dispatch and polling.

use axum::{
    body::Bytes,
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::api::rest::dto::{
    CreateServiceBindingRequest, CreateServiceInstanceRequest, GetBindingResponse,
    GetInstanceResponse, LastOperationQuery, LastOperationResponse, MutatingQuery,
    ProvisionResponse, ReadQuery, UpdateServiceInstanceRequest,
};
use crate::broker::Broker;
use crate::config::ServicePlan;
use crate::error::{ApiError, BrokerError};
use crate::operation::{self, OperationKind, OperationStatus};
use crate::provisioner::{
    CreateProvisioner, DeprovisionProvisioner, ProvisionScope, UpdateProvisioner,
};
use crate::registry::{keys, Entry, EntryKind, EntryMode};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, BrokerError> {
    serde_json::from_slice(body)
        .map_err(|e| BrokerError::parameter(format!("malformed request body: {e}")))
}

/// Mutating endpoints demand `accepts_incomplete=true`.
fn require_async(query: &MutatingQuery) -> Result<(), BrokerError> {
    if query.accepts_incomplete.as_deref() == Some("true") {
        Ok(())
    } else {
        Err(BrokerError::AsyncRequired)
    }
}

fn resolve_namespace(context: Option<&Value>, default: &str) -> Result<String, BrokerError> {
    match context.and_then(|c| c.get("namespace")) {
        None => Ok(default.to_string()),
        Some(Value::String(namespace)) => Ok(namespace.clone()),
        Some(_) => Err(BrokerError::parameter("context namespace must be a string")),
    }
}

fn validate_parameters(
    schema: Option<&Value>,
    parameters: Option<&Value>,
) -> Result<(), BrokerError> {
    let Some(schema) = schema else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| BrokerError::configuration(format!("invalid parameter schema: {e}")))?;
    let empty = Value::Object(serde_json::Map::new());
    let instance = parameters.unwrap_or(&empty);
    validator
        .validate(instance)
        .map_err(|e| BrokerError::validation(format!("parameters failed schema validation: {e}")))
}

fn instance_create_schema(plan: &ServicePlan) -> Option<&Value> {
    plan.schemas
        .as_ref()?
        .service_instance
        .as_ref()?
        .create
        .as_ref()?
        .parameters
        .as_ref()
}

fn instance_update_schema(plan: &ServicePlan) -> Option<&Value> {
    plan.schemas
        .as_ref()?
        .service_instance
        .as_ref()?
        .update
        .as_ref()?
        .parameters
        .as_ref()
}

fn binding_create_schema(plan: &ServicePlan) -> Option<&Value> {
    plan.schemas
        .as_ref()?
        .service_binding
        .as_ref()?
        .create
        .as_ref()?
        .parameters
        .as_ref()
}

/// Structural request equality for idempotency decisions:
/// `(service_id, plan_id, context, parameters)`.
fn same_request(
    entry: &Entry,
    service_id: &str,
    plan_id: &str,
    context: &Option<Value>,
    parameters: &Option<Value>,
) -> bool {
    entry.get(keys::SERVICE_ID) == Some(service_id)
        && entry.get(keys::PLAN_ID) == Some(plan_id)
        && entry.get_json::<Value>(keys::CONTEXT) == *context
        && entry.get_json::<Value>(keys::PARAMETERS) == *parameters
}

fn operation_in_flight(broker: &Broker, entry: &Entry) -> bool {
    broker.operations.in_flight(entry.kind(), entry.id()) || entry.get(keys::OPERATION).is_some()
}

fn accepted(operation_id: impl Into<String>) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(ProvisionResponse {
            operation: Some(operation_id.into()),
            dashboard_url: None,
        }),
    )
        .into_response()
}

fn polling_window(plan: Option<&ServicePlan>) -> Option<Duration> {
    plan.and_then(|p| p.maximum_polling_duration)
        .map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Health and catalog
// ---------------------------------------------------------------------------

pub async fn readyz(Extension(broker): Extension<Arc<Broker>>) -> Response {
    if broker.config.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "configuration not loaded"})),
        )
            .into_response()
    }
}

pub async fn healthz() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

/// The catalog section of the configuration, served verbatim.
pub async fn catalog(Extension(broker): Extension<Arc<Broker>>) -> Result<Response, ApiError> {
    let config = broker.snapshot()?;
    Ok(Json(config.catalog.clone()).into_response())
}

// ---------------------------------------------------------------------------
// Service instances
// ---------------------------------------------------------------------------

pub async fn create_instance(
    Extension(broker): Extension<Arc<Broker>>,
    Path(instance_id): Path<String>,
    Query(query): Query<MutatingQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let config = broker.snapshot()?;
    require_async(&query)?;
    let request: CreateServiceInstanceRequest = parse_body(&body)?;

    let (offering, plan) = config
        .plan(&request.service_id, &request.plan_id)
        .ok_or_else(|| {
            BrokerError::parameter(format!(
                "unknown service {:?} plan {:?}",
                request.service_id, request.plan_id
            ))
        })?;
    config
        .binding_for(&offering.name, &plan.name)
        .ok_or_else(|| {
            BrokerError::configuration(format!(
                "no configuration binding for service {:?} plan {:?}",
                offering.name, plan.name
            ))
        })?;

    validate_parameters(instance_create_schema(plan), request.parameters.as_ref())?;

    let mut entry = broker
        .open_entry(EntryKind::ServiceInstance, &instance_id, EntryMode::ReadWrite)
        .await?;

    if entry.is_persisted() {
        if !same_request(
            &entry,
            &request.service_id,
            &request.plan_id,
            &request.context,
            &request.parameters,
        ) {
            return Err(BrokerError::conflict(format!(
                "service instance {instance_id:?} already exists with a different configuration"
            ))
            .into());
        }
        // Identical repeat: still in flight gets the original operation id,
        // a completed instance gets a plain 200.
        if operation_in_flight(&broker, &entry) {
            let operation_id = entry.get(keys::OPERATION_ID).unwrap_or_default().to_string();
            return Ok(accepted(operation_id));
        }
        let dashboard_url = entry.get(keys::DASHBOARD_URL).map(str::to_string);
        return Ok((
            StatusCode::OK,
            Json(ProvisionResponse {
                operation: None,
                dashboard_url,
            }),
        )
            .into_response());
    }

    let namespace = resolve_namespace(
        request.context.as_ref(),
        &broker.settings.default_namespace,
    )?;
    entry.set(keys::NAMESPACE, &namespace);
    entry.set(keys::INSTANCE_ID, &instance_id);
    entry.set(keys::SERVICE_ID, &request.service_id);
    entry.set(keys::PLAN_ID, &request.plan_id);
    if let Some(context) = &request.context {
        entry.set_json(keys::CONTEXT, context)?;
    }
    if let Some(parameters) = &request.parameters {
        entry.set_json(keys::PARAMETERS, parameters)?;
    }

    let parameters = request.parameters.clone().unwrap_or_else(|| json!({}));
    let mut provisioner = CreateProvisioner::new(
        Arc::clone(&broker.platform),
        Arc::clone(&config),
        entry,
        namespace,
        ProvisionScope::Instance,
    );
    provisioner.prepare(&parameters)?;

    let (operation_id, sender) = broker
        .operations
        .begin(provisioner.entry_mut(), OperationKind::Provision)
        .await?;
    operation::dispatch(sender, polling_window(Some(plan)), provisioner.run());

    Ok(accepted(operation_id.to_string()))
}

pub async fn read_instance(
    Extension(broker): Extension<Arc<Broker>>,
    Path(instance_id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    let entry = broker
        .open_entry(EntryKind::ServiceInstance, &instance_id, EntryMode::ReadOnly)
        .await?;

    if !entry.is_persisted() || entry.get(keys::OPERATION) == Some("provision") {
        return Err(
            BrokerError::not_found(format!("service instance {instance_id:?} not found")).into(),
        );
    }

    let service_id = entry.get(keys::SERVICE_ID).unwrap_or_default().to_string();
    let plan_id = entry.get(keys::PLAN_ID).unwrap_or_default().to_string();

    if let Some(requested) = &query.service_id {
        if *requested != service_id {
            return Err(BrokerError::query("service_id does not match the instance").into());
        }
    }
    if let Some(requested) = &query.plan_id {
        if *requested != plan_id {
            return Err(BrokerError::query("plan_id does not match the instance").into());
        }
    }

    Ok(Json(GetInstanceResponse {
        service_id,
        plan_id,
        dashboard_url: entry.get(keys::DASHBOARD_URL).map(str::to_string),
        parameters: entry.get_json(keys::PARAMETERS),
    })
    .into_response())
}

pub async fn update_instance(
    Extension(broker): Extension<Arc<Broker>>,
    Path(instance_id): Path<String>,
    Query(query): Query<MutatingQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let usable = |error: BrokerError| ApiError::with_usable(error, true);

    let config = broker.snapshot().map_err(usable)?;
    require_async(&query).map_err(usable)?;
    let request: UpdateServiceInstanceRequest = parse_body(&body).map_err(usable)?;

    let mut entry = broker
        .open_entry(EntryKind::ServiceInstance, &instance_id, EntryMode::ReadWrite)
        .await
        .map_err(usable)?;
    if !entry.is_persisted() {
        return Err(usable(BrokerError::not_found(format!(
            "service instance {instance_id:?} not found"
        ))));
    }

    let stored_service = entry.get(keys::SERVICE_ID).unwrap_or_default().to_string();
    let stored_plan = entry.get(keys::PLAN_ID).unwrap_or_default().to_string();
    if request.service_id != stored_service {
        return Err(usable(BrokerError::parameter(
            "service_id does not match the instance",
        )));
    }

    let offering = config
        .offering(&stored_service)
        .ok_or_else(|| usable(BrokerError::configuration("service offering no longer cataloged")))?;

    let new_plan_id = request.plan_id.clone().unwrap_or_else(|| stored_plan.clone());
    if new_plan_id != stored_plan && !offering.plan_updatable {
        return Err(usable(BrokerError::parameter(format!(
            "service {:?} does not allow plan updates",
            offering.name
        ))));
    }
    let (_, plan) = config.plan(&stored_service, &new_plan_id).ok_or_else(|| {
        usable(BrokerError::parameter(format!(
            "unknown plan {new_plan_id:?}"
        )))
    })?;

    validate_parameters(instance_update_schema(plan), request.parameters.as_ref())
        .map_err(usable)?;

    entry.set(keys::PLAN_ID, &new_plan_id);
    if let Some(context) = &request.context {
        entry.set_json(keys::CONTEXT, context).map_err(usable)?;
    }
    if let Some(parameters) = &request.parameters {
        entry.set_json(keys::PARAMETERS, parameters).map_err(usable)?;
    }

    let namespace = entry
        .get(keys::NAMESPACE)
        .unwrap_or(broker.settings.default_namespace.as_str())
        .to_string();
    let parameters = request.parameters.clone().unwrap_or_else(|| json!({}));

    let mut provisioner = UpdateProvisioner::new(
        Arc::clone(&broker.platform),
        Arc::clone(&config),
        entry,
        namespace,
    );
    provisioner.prepare(&parameters).await.map_err(usable)?;

    let (operation_id, sender) = broker
        .operations
        .begin(provisioner.entry_mut(), OperationKind::Update)
        .await
        .map_err(usable)?;
    operation::dispatch(sender, polling_window(Some(plan)), provisioner.run());

    Ok(accepted(operation_id.to_string()))
}

pub async fn delete_instance(
    Extension(broker): Extension<Arc<Broker>>,
    Path(instance_id): Path<String>,
    Query(query): Query<MutatingQuery>,
) -> Result<Response, ApiError> {
    let usable = |error: BrokerError| ApiError::with_usable(error, true);

    require_async(&query).map_err(usable)?;
    let service_id = query
        .service_id
        .as_deref()
        .ok_or_else(|| usable(BrokerError::query("service_id query parameter is required")))?;
    let plan_id = query
        .plan_id
        .as_deref()
        .ok_or_else(|| usable(BrokerError::query("plan_id query parameter is required")))?;

    let entry = broker
        .open_entry(EntryKind::ServiceInstance, &instance_id, EntryMode::ReadWrite)
        .await
        .map_err(usable)?;
    if !entry.is_persisted() {
        return Err(usable(BrokerError::gone(format!(
            "service instance {instance_id:?} does not exist"
        ))));
    }
    if entry.get(keys::SERVICE_ID) != Some(service_id) {
        return Err(usable(BrokerError::query(
            "service_id does not match the instance",
        )));
    }
    if entry.get(keys::PLAN_ID) != Some(plan_id) {
        return Err(usable(BrokerError::query(
            "plan_id does not match the instance",
        )));
    }

    // The polling window still applies if the plan is still cataloged.
    let window = broker
        .snapshot()
        .ok()
        .and_then(|config| config.plan(service_id, plan_id).map(|(_, p)| p.maximum_polling_duration))
        .flatten()
        .map(Duration::from_secs);

    let mut provisioner = DeprovisionProvisioner::new(entry);
    let (operation_id, sender) = broker
        .operations
        .begin(provisioner.entry_mut(), OperationKind::Deprovision)
        .await
        .map_err(usable)?;
    operation::dispatch(sender, window, provisioner.run());

    Ok(accepted(operation_id.to_string()))
}

pub async fn poll_instance(
    Extension(broker): Extension<Arc<Broker>>,
    Path(instance_id): Path<String>,
    Query(query): Query<LastOperationQuery>,
) -> Result<Response, ApiError> {
    poll_entity(&broker, EntryKind::ServiceInstance, &instance_id, &query).await
}

// ---------------------------------------------------------------------------
// Service bindings
// ---------------------------------------------------------------------------

pub async fn create_binding(
    Extension(broker): Extension<Arc<Broker>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<MutatingQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let config = broker.snapshot()?;
    require_async(&query)?;
    let request: CreateServiceBindingRequest = parse_body(&body)?;

    let instance = broker
        .open_entry(EntryKind::ServiceInstance, &instance_id, EntryMode::ReadOnly)
        .await?;
    if !instance.is_persisted() {
        return Err(
            BrokerError::not_found(format!("service instance {instance_id:?} not found")).into(),
        );
    }
    if instance.get(keys::SERVICE_ID) != Some(request.service_id.as_str())
        || instance.get(keys::PLAN_ID) != Some(request.plan_id.as_str())
    {
        return Err(
            BrokerError::parameter("service_id/plan_id do not match the service instance").into(),
        );
    }

    let (offering, plan) = config
        .plan(&request.service_id, &request.plan_id)
        .ok_or_else(|| {
            BrokerError::parameter(format!(
                "unknown service {:?} plan {:?}",
                request.service_id, request.plan_id
            ))
        })?;
    if !offering.plan_bindable(plan) {
        return Err(BrokerError::parameter(format!(
            "plan {:?} is not bindable",
            plan.name
        ))
        .into());
    }

    validate_parameters(binding_create_schema(plan), request.parameters.as_ref())?;

    let mut entry = broker
        .open_entry(EntryKind::ServiceBinding, &binding_id, EntryMode::ReadWrite)
        .await?;

    if entry.is_persisted() {
        if !same_request(
            &entry,
            &request.service_id,
            &request.plan_id,
            &request.context,
            &request.parameters,
        ) {
            return Err(BrokerError::conflict(format!(
                "service binding {binding_id:?} already exists with a different configuration"
            ))
            .into());
        }
        if operation_in_flight(&broker, &entry) {
            let operation_id = entry.get(keys::OPERATION_ID).unwrap_or_default().to_string();
            return Ok(accepted(operation_id));
        }
        return Ok((
            StatusCode::OK,
            Json(GetBindingResponse {
                credentials: entry.get_json(keys::CREDENTIALS),
                parameters: entry.get_json(keys::PARAMETERS),
            }),
        )
            .into_response());
    }

    // Binding templates may reference instance-scoped registry values; seed
    // the new entry with everything templates can see on the instance.
    entry.absorb(instance.template_visible_data());
    entry.set(keys::BINDING_ID, &binding_id);
    entry.set(keys::SERVICE_ID, &request.service_id);
    entry.set(keys::PLAN_ID, &request.plan_id);
    if let Some(context) = &request.context {
        entry.set_json(keys::CONTEXT, context)?;
    } else {
        entry.unset(keys::CONTEXT);
    }
    if let Some(parameters) = &request.parameters {
        entry.set_json(keys::PARAMETERS, parameters)?;
    } else {
        entry.unset(keys::PARAMETERS);
    }

    let namespace = entry
        .get(keys::NAMESPACE)
        .unwrap_or(broker.settings.default_namespace.as_str())
        .to_string();
    let parameters = request.parameters.clone().unwrap_or_else(|| json!({}));

    let mut provisioner = CreateProvisioner::new(
        Arc::clone(&broker.platform),
        Arc::clone(&config),
        entry,
        namespace,
        ProvisionScope::Binding,
    );
    provisioner.prepare(&parameters)?;

    let (operation_id, sender) = broker
        .operations
        .begin(provisioner.entry_mut(), OperationKind::Provision)
        .await?;
    operation::dispatch(sender, polling_window(Some(plan)), provisioner.run());

    Ok(accepted(operation_id.to_string()))
}

pub async fn read_binding(
    Extension(broker): Extension<Arc<Broker>>,
    Path((_instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    let entry = broker
        .open_entry(EntryKind::ServiceBinding, &binding_id, EntryMode::ReadOnly)
        .await?;

    if !entry.is_persisted() || entry.get(keys::OPERATION) == Some("provision") {
        return Err(
            BrokerError::not_found(format!("service binding {binding_id:?} not found")).into(),
        );
    }

    if let Some(requested) = &query.service_id {
        if entry.get(keys::SERVICE_ID) != Some(requested.as_str()) {
            return Err(BrokerError::query("service_id does not match the binding").into());
        }
    }
    if let Some(requested) = &query.plan_id {
        if entry.get(keys::PLAN_ID) != Some(requested.as_str()) {
            return Err(BrokerError::query("plan_id does not match the binding").into());
        }
    }

    Ok(Json(GetBindingResponse {
        credentials: entry.get_json(keys::CREDENTIALS),
        parameters: entry.get_json(keys::PARAMETERS),
    })
    .into_response())
}

pub async fn delete_binding(
    Extension(broker): Extension<Arc<Broker>>,
    Path((_instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<MutatingQuery>,
) -> Result<Response, ApiError> {
    let usable = |error: BrokerError| ApiError::with_usable(error, true);

    require_async(&query).map_err(usable)?;
    let service_id = query
        .service_id
        .as_deref()
        .ok_or_else(|| usable(BrokerError::query("service_id query parameter is required")))?;
    let plan_id = query
        .plan_id
        .as_deref()
        .ok_or_else(|| usable(BrokerError::query("plan_id query parameter is required")))?;

    let entry = broker
        .open_entry(EntryKind::ServiceBinding, &binding_id, EntryMode::ReadWrite)
        .await
        .map_err(usable)?;
    if !entry.is_persisted() {
        return Err(usable(BrokerError::gone(format!(
            "service binding {binding_id:?} does not exist"
        ))));
    }
    if entry.get(keys::SERVICE_ID) != Some(service_id) {
        return Err(usable(BrokerError::query(
            "service_id does not match the binding",
        )));
    }
    if entry.get(keys::PLAN_ID) != Some(plan_id) {
        return Err(usable(BrokerError::query(
            "plan_id does not match the binding",
        )));
    }

    let mut provisioner = DeprovisionProvisioner::new(entry);
    let (operation_id, sender) = broker
        .operations
        .begin(provisioner.entry_mut(), OperationKind::Deprovision)
        .await
        .map_err(usable)?;
    operation::dispatch(sender, None, provisioner.run());

    Ok(accepted(operation_id.to_string()))
}

pub async fn poll_binding(
    Extension(broker): Extension<Arc<Broker>>,
    Path((_instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<LastOperationQuery>,
) -> Result<Response, ApiError> {
    poll_entity(&broker, EntryKind::ServiceBinding, &binding_id, &query).await
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

async fn poll_entity(
    broker: &Broker,
    kind: EntryKind,
    id: &str,
    query: &LastOperationQuery,
) -> Result<Response, ApiError> {
    let mut entry = broker.open_entry(kind, id, EntryMode::ReadWrite).await?;

    if entry.is_persisted() {
        if let Some(requested) = &query.service_id {
            if entry.get(keys::SERVICE_ID) != Some(requested.as_str()) {
                return Err(BrokerError::query("service_id does not match").into());
            }
        }
        if let Some(requested) = &query.plan_id {
            if entry.get(keys::PLAN_ID) != Some(requested.as_str()) {
                return Err(BrokerError::query("plan_id does not match").into());
            }
        }
        if let (Some(requested), Some(current)) = (&query.operation, entry.get(keys::OPERATION_ID))
        {
            if requested != current {
                return Err(BrokerError::query("operation does not match").into());
            }
        }
    } else if !broker.operations.in_flight(kind, id) && broker.settings.strict_polling {
        // Nothing in flight and nothing recorded. Permissive platforms want
        // "succeeded" here; strict mode reports the entity as unknown.
        return Err(BrokerError::not_found(format!(
            "{} {id:?} has no operation to poll",
            kind.describe()
        ))
        .into());
    }

    let status = broker.operations.drain(&mut entry).await?;
    let response = match status {
        OperationStatus::InProgress => LastOperationResponse {
            state: "in progress",
            description: None,
        },
        OperationStatus::Succeeded => LastOperationResponse {
            state: "succeeded",
            description: None,
        },
        OperationStatus::Failed(message) => LastOperationResponse {
            state: "failed",
            description: Some(message),
        },
    };
    Ok(Json(response).into_response())
}
