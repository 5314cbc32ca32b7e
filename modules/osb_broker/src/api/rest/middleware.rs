//! Request guards applied to the `/v2` subtree: OSB API version negotiation,
//! bearer authentication and the JSON content-type requirement.

use axum::{
    extract::Request,
    http::{header, HeaderName, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;

use crate::broker::Broker;
use crate::error::{ApiError, BrokerError, ErrorBody};

pub const API_VERSION_HEADER: &str = "x-broker-api-version";

/// Minimum supported OSB API version.
const MIN_VERSION: (u32, u32) = (2, 13);

fn query_error(message: &str) -> Response {
    ApiError::from(BrokerError::query(message)).into_response()
}

/// Enforce a single, well-formed `X-Broker-API-Version` header at or above
/// 2.13. Missing or malformed: 400. Too old: 412.
pub async fn require_api_version(req: Request, next: Next) -> Response {
    let header_name = HeaderName::from_static(API_VERSION_HEADER);
    let mut values = req.headers().get_all(&header_name).iter();

    let Some(value) = values.next() else {
        return query_error("missing X-Broker-API-Version header");
    };
    if values.next().is_some() {
        return query_error("duplicate X-Broker-API-Version header");
    }

    let Some(version) = value.to_str().ok().and_then(parse_version) else {
        return query_error("malformed X-Broker-API-Version header");
    };

    if version < MIN_VERSION {
        let body = ErrorBody {
            error: "APIVersionTooOld",
            description: format!(
                "broker requires OSB API version {}.{} or newer",
                MIN_VERSION.0, MIN_VERSION.1
            ),
            instance_usable: None,
        };
        return (StatusCode::PRECONDITION_FAILED, Json(body)).into_response();
    }

    next.run(req).await
}

fn parse_version(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Bearer token check. Disabled when no token is configured.
pub async fn require_bearer_auth(
    Extension(broker): Extension<Arc<Broker>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = broker.settings.token.clone() else {
        return next.run(req).await;
    };

    let mut values = req.headers().get_all(header::AUTHORIZATION).iter();
    match (values.next(), values.next()) {
        (Some(_), Some(_)) => query_error("duplicate Authorization header"),
        (None, _) => unauthorized(),
        (Some(value), None) => {
            let presented = value
                .to_str()
                .ok()
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented == Some(expected.as_str()) {
                next.run(req).await
            } else {
                unauthorized()
            }
        }
    }
}

fn unauthorized() -> Response {
    let body = ErrorBody {
        error: "Unauthorized",
        description: "missing or invalid bearer token".to_string(),
        instance_usable: None,
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

/// Body-bearing requests must declare `Content-Type: application/json`.
pub async fn require_json_content_type(req: Request, next: Next) -> Response {
    if matches!(*req.method(), Method::PUT | Method::PATCH) {
        let declared = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase());
        if declared.as_deref() != Some("application/json") {
            return ApiError::from(BrokerError::parameter(
                "requests with a body must declare Content-Type: application/json",
            ))
            .into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("2.13"), Some((2, 13)));
        assert_eq!(parse_version(" 2.17 "), Some((2, 17)));
        assert_eq!(parse_version("2"), None);
        assert_eq!(parse_version("two.thirteen"), None);
        assert!(parse_version("2.12").unwrap() < MIN_VERSION);
        assert!(parse_version("3.0").unwrap() >= MIN_VERSION);
    }
}
