use axum::{
    middleware::from_fn,
    routing::{get, put},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::api::rest::{handlers, middleware};
use crate::broker::Broker;

/// Assemble the OSB router. Header guards only apply to the `/v2` subtree;
/// the health probes stay open.
pub fn router(broker: Arc<Broker>) -> Router {
    let v2 = Router::new()
        .route("/catalog", get(handlers::catalog))
        .route(
            "/service_instances/{instance_id}",
            put(handlers::create_instance)
                .get(handlers::read_instance)
                .patch(handlers::update_instance)
                .delete(handlers::delete_instance),
        )
        .route(
            "/service_instances/{instance_id}/last_operation",
            get(handlers::poll_instance),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(handlers::create_binding)
                .get(handlers::read_binding)
                .delete(handlers::delete_binding),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}/last_operation",
            get(handlers::poll_binding),
        )
        .layer(from_fn(middleware::require_json_content_type))
        .layer(from_fn(middleware::require_bearer_auth))
        .layer(from_fn(middleware::require_api_version));

    Router::new()
        .route("/readyz", get(handlers::readyz))
        .route("/healthz", get(handlers::healthz))
        .nest("/v2", v2)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(Extension(broker))
}
