//! End-to-end instance lifecycle against the real router and the in-memory
//! platform.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use osb_broker::api;
use osb_broker::config::BrokerConfig;
use osb_broker::platform::{MemoryPlatform, Platform, ResourceRef};
use osb_broker::{Broker, BrokerSettings};

const SERVICE_ID: &str = "dd2cce49-3813-4923-8f3c-6fc7d5e4343e";
const STABLE_PLAN: &str = "3f525c60-bd66-4f91-8967-113e9c053d05";
const WILD_PLAN: &str = "e5a0e8a6-0d00-4a38-bbd2-6b33dd438417";
const HERD_PLAN: &str = "6e5e8a0f-6dcc-4dd6-9b4d-2b3a2fdc35f2";
const FUSSY_PLAN: &str = "9c36a3a5-9a0e-4e55-b722-90e52a63be31";

const BROKER_DOC: &str = r#"
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
                  properties:
                    animal:
                      type: string
        - id: e5a0e8a6-0d00-4a38-bbd2-6b33dd438417
          name: wild
          description: An unbindable pony
          bindable: false
        - id: 6e5e8a0f-6dcc-4dd6-9b4d-2b3a2fdc35f2
          name: herd
          description: Ponies sharing infrastructure
          bindable: false
        - id: 9c36a3a5-9a0e-4e55-b722-90e52a63be31
          name: fussy
          description: A pony that insists on being named
          bindable: false
        - id: 0d0f1e6c-94dd-4d82-bbf6-41b2c1ac8d31
          name: clumsy
          description: Ponies that trip over each other
          bindable: false
templates:
  - name: pony-config
    template:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: placeholder
      data: {}
    parameters:
      - name: resource-name
        source:
          format:
            format: pony-%s
            args:
              - registry:
                  key: instance-id
        destinations:
          - path:
              pointer: /metadata/name
      - name: animal
        source:
          parameter:
            pointer: /animal
        destinations:
          - path:
              pointer: /data/animal
          - registry:
              key: animal
  - name: shared-lb
    singleton: true
    template:
      apiVersion: v1
      kind: Service
      metadata:
        name: shared-lb
  - name: fixed-cm
    template:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: clumsy-shared
bindings:
  - name: stable-ponies
    service: ponies
    plan: stable
    service_instance:
      parameters:
        - name: dashboard
          source:
            format:
              format: https://ponies.example.com/%s
              args:
                - registry:
                    key: instance-id
          destinations:
            - registry:
                key: dashboard-url
      templates:
        - pony-config
    service_binding:
      parameters:
        - name: password
          source:
            generate_password:
              length: 16
          destinations:
            - registry:
                key: password
        - name: credentials
          source:
            format:
              format: "{\"password\":\"%s\",\"animal\":\"%s\"}"
              args:
                - registry:
                    key: password
                - registry:
                    key: animal
          destinations:
            - registry:
                key: credentials
  - name: wild-ponies
    service: ponies
    plan: wild
    service_instance:
      templates:
        - pony-config
  - name: herd-ponies
    service: ponies
    plan: herd
    service_instance:
      templates:
        - shared-lb
  - name: clumsy-ponies
    service: ponies
    plan: clumsy
    service_instance:
      templates:
        - fixed-cm
  - name: fussy-ponies
    service: ponies
    plan: fussy
    service_instance:
      parameters:
        - name: animal
          source:
            parameter:
              pointer: /animal
          required: true
          destinations:
            - registry:
                key: animal
      templates:
        - pony-config
"#;

fn test_broker() -> (Arc<Broker>, Arc<MemoryPlatform>, Router) {
    let platform = Arc::new(MemoryPlatform::new());
    let broker = Arc::new(Broker::new(
        BrokerSettings::default(),
        Arc::clone(&platform) as Arc<dyn Platform>,
    ));
    broker
        .config
        .replace(BrokerConfig::from_yaml(BROKER_DOC).unwrap())
        .unwrap();
    let app = api::router(Arc::clone(&broker));
    (broker, platform, app)
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-broker-api-version", "2.16");
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    builder
        .body(match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        })
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn create_body(plan_id: &str, parameters: Option<Value>) -> Value {
    let mut body = json!({
        "service_id": SERVICE_ID,
        "plan_id": plan_id,
    });
    if let Some(parameters) = parameters {
        body["parameters"] = parameters;
    }
    body
}

async fn poll_until_done(app: &Router, path: &str) -> Value {
    for _ in 0..100 {
        let (status, body) = send(app, request(Method::GET, path, None)).await;
        assert_eq!(status, StatusCode::OK, "poll failed: {body}");
        if body["state"] != "in progress" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("operation did not complete");
}

async fn provision(app: &Router, instance_id: &str, plan_id: &str, parameters: Option<Value>) {
    let (status, body) = send(
        app,
        request(
            Method::PUT,
            &format!("/v2/service_instances/{instance_id}?accepts_incomplete=true"),
            Some(create_body(plan_id, parameters)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "create failed: {body}");
    assert!(body["operation"].is_string());

    let done = poll_until_done(
        app,
        &format!("/v2/service_instances/{instance_id}/last_operation"),
    )
    .await;
    assert_eq!(done["state"], "succeeded", "provision failed: {done}");
}

#[tokio::test]
async fn create_poll_read_round_trip() {
    let (_broker, platform, app) = test_broker();

    provision(&app, "pinkiepie", STABLE_PLAN, Some(json!({"animal": "cat"}))).await;

    // Read echoes the stored identifiers.
    let (status, body) = send(
        &app,
        request(Method::GET, "/v2/service_instances/pinkiepie", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service_id"], SERVICE_ID);
    assert_eq!(body["plan_id"], STABLE_PLAN);
    assert_eq!(body["dashboard_url"], "https://ponies.example.com/pinkiepie");
    assert_eq!(body["parameters"]["animal"], "cat");

    // The rendered resource landed on the platform with the parameter patch.
    let resource = platform
        .resource(&ResourceRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "default".to_string(),
            name: "pony-pinkiepie".to_string(),
        })
        .expect("rendered resource should exist");
    assert_eq!(resource["data"]["animal"], "cat");
    assert!(resource["metadata"]["ownerReferences"].is_array());

    // The registry entry captured the parameter write.
    let record = platform
        .kv_record("default", "service-instance-pinkiepie")
        .unwrap();
    assert_eq!(record.data.get("animal").map(String::as_str), Some("cat"));
}

#[tokio::test]
async fn omitted_optional_parameter_leaves_registry_unset() {
    let (_broker, platform, app) = test_broker();

    provision(&app, "rarity", STABLE_PLAN, None).await;

    let record = platform
        .kv_record("default", "service-instance-rarity")
        .unwrap();
    assert!(!record.data.contains_key("animal"));
}

#[tokio::test]
async fn required_parameter_omission_is_a_400_naming_the_parameter() {
    let (_broker, platform, app) = test_broker();

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/fluttershy?accepts_incomplete=true",
            Some(create_body(FUSSY_PLAN, None)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ParameterError");
    assert!(body["description"].as_str().unwrap().contains("animal"));

    // Failure before commit: the registry entry was never persisted.
    assert!(platform
        .kv_record("default", "service-instance-fluttershy")
        .is_none());
}

#[tokio::test]
async fn schema_validation_rejects_bad_parameters() {
    let (_broker, _platform, app) = test_broker();

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/twilight?accepts_incomplete=true",
            Some(create_body(STABLE_PLAN, Some(json!({"animal": 42})))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");
}

#[tokio::test]
async fn identical_repeat_is_never_a_conflict() {
    let (_broker, _platform, app) = test_broker();
    let body = create_body(STABLE_PLAN, Some(json!({"animal": "cat"})));

    let (status, first) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/pinkiepie?accepts_incomplete=true",
            Some(body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Identical repeat while the operation is still undrained: 202 with the
    // original operation id.
    let (status, repeat) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/pinkiepie?accepts_incomplete=true",
            Some(body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(repeat["operation"], first["operation"]);

    let done = poll_until_done(&app, "/v2/service_instances/pinkiepie/last_operation").await;
    assert_eq!(done["state"], "succeeded");

    // Identical repeat after completion: 200.
    let (status, after) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/pinkiepie?accepts_incomplete=true",
            Some(body),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["dashboard_url"], "https://ponies.example.com/pinkiepie");
}

#[tokio::test]
async fn divergent_repeat_is_a_conflict() {
    let (_broker, _platform, app) = test_broker();

    provision(&app, "pinkiepie", STABLE_PLAN, None).await;

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/pinkiepie?accepts_incomplete=true",
            Some(create_body(WILD_PLAN, None)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "ResourceConflict");
}

#[tokio::test]
async fn mutating_endpoints_require_async_support() {
    let (_broker, _platform, app) = test_broker();

    for (method, uri) in [
        (Method::PUT, "/v2/service_instances/pinkiepie"),
        (Method::PATCH, "/v2/service_instances/pinkiepie"),
        (Method::DELETE, "/v2/service_instances/pinkiepie"),
        (
            Method::PUT,
            "/v2/service_instances/pinkiepie/service_bindings/b1",
        ),
    ] {
        let body = if method == Method::DELETE {
            None
        } else {
            Some(create_body(STABLE_PLAN, None))
        };
        let (status, response) = send(&app, request(method.clone(), uri, body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{method} {uri}");
        assert_eq!(response["error"], "AsyncRequired");
    }
}

#[tokio::test]
async fn delete_removes_entry_and_frees_the_id() {
    let (_broker, platform, app) = test_broker();

    provision(&app, "pinkiepie", STABLE_PLAN, Some(json!({"animal": "cat"}))).await;
    assert!(platform
        .kv_record("default", "service-instance-pinkiepie")
        .is_some());

    let (status, _) = send(
        &app,
        request(
            Method::DELETE,
            &format!(
                "/v2/service_instances/pinkiepie?accepts_incomplete=true&service_id={SERVICE_ID}&plan_id={STABLE_PLAN}"
            ),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = poll_until_done(&app, "/v2/service_instances/pinkiepie/last_operation").await;
    assert_eq!(done["state"], "succeeded");

    // Registry entry gone, owner-referenced resources reaped.
    assert!(platform
        .kv_record("default", "service-instance-pinkiepie")
        .is_none());
    assert!(platform
        .resource(&ResourceRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "default".to_string(),
            name: "pony-pinkiepie".to_string(),
        })
        .is_none());

    // The id can be provisioned again.
    provision(&app, "pinkiepie", STABLE_PLAN, None).await;
}

#[tokio::test]
async fn delete_query_parameters_are_mandatory_and_checked() {
    let (_broker, _platform, app) = test_broker();

    provision(&app, "pinkiepie", STABLE_PLAN, None).await;

    // Missing plan_id.
    let (status, body) = send(
        &app,
        request(
            Method::DELETE,
            &format!(
                "/v2/service_instances/pinkiepie?accepts_incomplete=true&service_id={SERVICE_ID}"
            ),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "QueryError");

    // Mismatched plan_id.
    let (status, body) = send(
        &app,
        request(
            Method::DELETE,
            &format!(
                "/v2/service_instances/pinkiepie?accepts_incomplete=true&service_id={SERVICE_ID}&plan_id={WILD_PLAN}"
            ),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "QueryError");

    // Absent instance is 410.
    let (status, body) = send(
        &app,
        request(
            Method::DELETE,
            &format!(
                "/v2/service_instances/nobody?accepts_incomplete=true&service_id={SERVICE_ID}&plan_id={STABLE_PLAN}"
            ),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "ResourceGone");
}

#[tokio::test]
async fn singleton_resource_is_shared_across_instances() {
    let (_broker, platform, app) = test_broker();

    provision(&app, "applejack", HERD_PLAN, None).await;
    provision(&app, "rainbow", HERD_PLAN, None).await;

    let shared = platform
        .resource(&ResourceRef {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            namespace: "default".to_string(),
            name: "shared-lb".to_string(),
        })
        .expect("shared resource should exist");
    let owners = shared
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .unwrap();
    assert_eq!(owners.len(), 2, "both instances should own the singleton");

    // Deleting one instance keeps the shared resource alive.
    let (status, _) = send(
        &app,
        request(
            Method::DELETE,
            &format!(
                "/v2/service_instances/applejack?accepts_incomplete=true&service_id={SERVICE_ID}&plan_id={HERD_PLAN}"
            ),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let done = poll_until_done(&app, "/v2/service_instances/applejack/last_operation").await;
    assert_eq!(done["state"], "succeeded");

    let shared = platform
        .resource(&ResourceRef {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            namespace: "default".to_string(),
            name: "shared-lb".to_string(),
        })
        .expect("shared resource should survive one owner");
    let owners = shared
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .unwrap();
    assert_eq!(owners.len(), 1);
}

#[tokio::test]
async fn update_re_renders_and_patches_the_live_object() {
    let (_broker, platform, app) = test_broker();

    provision(&app, "pinkiepie", STABLE_PLAN, Some(json!({"animal": "cat"}))).await;

    let (status, body) = send(
        &app,
        request(
            Method::PATCH,
            "/v2/service_instances/pinkiepie?accepts_incomplete=true",
            Some(json!({
                "service_id": SERVICE_ID,
                "parameters": {"animal": "dog"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "update failed: {body}");

    let done = poll_until_done(&app, "/v2/service_instances/pinkiepie/last_operation").await;
    assert_eq!(done["state"], "succeeded");

    let resource = platform
        .resource(&ResourceRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "default".to_string(),
            name: "pony-pinkiepie".to_string(),
        })
        .unwrap();
    assert_eq!(resource["data"]["animal"], "dog");
    // Decorations from the create survive the merge patch.
    assert!(resource["metadata"]["ownerReferences"].is_array());
}

#[tokio::test]
async fn update_of_missing_instance_is_404() {
    let (_broker, _platform, app) = test_broker();

    let (status, body) = send(
        &app,
        request(
            Method::PATCH,
            "/v2/service_instances/nobody?accepts_incomplete=true",
            Some(json!({"service_id": SERVICE_ID})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ResourceNotFound");
    assert_eq!(body["instance_usable"], true);
}

#[tokio::test]
async fn read_of_missing_instance_is_404_and_mismatch_is_400() {
    let (_broker, _platform, app) = test_broker();

    let (status, _) = send(
        &app,
        request(Method::GET, "/v2/service_instances/nobody", None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    provision(&app, "pinkiepie", STABLE_PLAN, None).await;
    let (status, body) = send(
        &app,
        request(
            Method::GET,
            &format!("/v2/service_instances/pinkiepie?service_id={SERVICE_ID}&plan_id={WILD_PLAN}"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "QueryError");
}

#[tokio::test]
async fn polling_with_nothing_in_flight_reports_success() {
    let (_broker, _platform, app) = test_broker();

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/v2/service_instances/unknown/last_operation",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "succeeded");
}

#[tokio::test]
async fn strict_polling_reports_unknown_entities() {
    let platform = Arc::new(MemoryPlatform::new());
    let broker = Arc::new(Broker::new(
        BrokerSettings {
            strict_polling: true,
            ..BrokerSettings::default()
        },
        Arc::clone(&platform) as Arc<dyn Platform>,
    ));
    broker
        .config
        .replace(BrokerConfig::from_yaml(BROKER_DOC).unwrap())
        .unwrap();
    let app = api::router(Arc::clone(&broker));

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/v2/service_instances/unknown/last_operation",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "ResourceNotFound");
}

#[tokio::test]
async fn poll_operation_query_mismatch_is_a_400() {
    let (_broker, _platform, app) = test_broker();

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/pinkiepie?accepts_incomplete=true",
            Some(create_body(STABLE_PLAN, None)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let operation = body["operation"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/v2/service_instances/pinkiepie/last_operation?operation=bogus",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "QueryError");

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            &format!("/v2/service_instances/pinkiepie/last_operation?operation={operation}"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "matching operation id polls: {body}");
}

#[tokio::test]
async fn async_failure_surfaces_on_poll_and_persists() {
    const CLUMSY_PLAN: &str = "0d0f1e6c-94dd-4d82-bbf6-41b2c1ac8d31";
    let (_broker, _platform, app) = test_broker();

    // First instance claims the fixed-name resource.
    provision(&app, "first", CLUMSY_PLAN, None).await;

    // The second instance collides asynchronously; the create is still
    // accepted and the failure is delivered through the poll.
    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/second?accepts_incomplete=true",
            Some(create_body(CLUMSY_PLAN, None)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = poll_until_done(&app, "/v2/service_instances/second/last_operation").await;
    assert_eq!(done["state"], "failed");
    assert!(done["description"]
        .as_str()
        .unwrap()
        .contains("already exists"));

    // The failure is persisted: a later poll with nothing in flight replays it.
    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/v2/service_instances/second/last_operation",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "failed");
}

#[tokio::test]
async fn context_namespace_overrides_the_default() {
    let (_broker, platform, app) = test_broker();

    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/zoned?accepts_incomplete=true",
            Some(json!({
                "service_id": SERVICE_ID,
                "plan_id": WILD_PLAN,
                "context": {"namespace": "zoo"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let done = poll_until_done(&app, "/v2/service_instances/zoned/last_operation").await;
    assert_eq!(done["state"], "succeeded");

    assert!(platform
        .resource(&ResourceRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "zoo".to_string(),
            name: "pony-zoned".to_string(),
        })
        .is_some());
}

#[tokio::test]
async fn non_string_context_namespace_is_a_parameter_error() {
    let (_broker, _platform, app) = test_broker();

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            "/v2/service_instances/zoned?accepts_incomplete=true",
            Some(json!({
                "service_id": SERVICE_ID,
                "plan_id": WILD_PLAN,
                "context": {"namespace": 42}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ParameterError");
}
