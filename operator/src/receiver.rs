//! CloudEvents receiver run by `--mode=receiver` services.
//!
//! Knative triggers deliver events to `/` (or `/events`) in binary or
//! structured content mode. Command events create, update or delete
//! `LambdaFunction` resources; response events feed the invocation metrics.
//! Everything else is acknowledged and dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::crd::{LambdaFunction, LambdaFunctionSpec};
use crate::error::Error;
use crate::event::Outcome;
use crate::metrics::Metrics;
use crate::server::shutdown_signal;

pub const FUNCTION_DEPLOY: &str = "io.knative.lambda.command.function.deploy";
pub const SERVICE_CREATE: &str = "io.knative.lambda.command.service.create";
pub const SERVICE_UPDATE: &str = "io.knative.lambda.command.service.update";
pub const SERVICE_DELETE: &str = "io.knative.lambda.command.service.delete";
pub const RESPONSE_SUCCESS: &str = "io.knative.lambda.response.success";
pub const RESPONSE_ERROR: &str = "io.knative.lambda.response.error";

pub const EVENT_ID_ANNOTATION: &str = "lambda.knative.io/cloudevent-id";
pub const EVENT_SOURCE_ANNOTATION: &str = "lambda.knative.io/cloudevent-source";

const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");
const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// The context attributes and payload of one CloudEvent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("invalid CloudEvent: {0}")]
    InvalidEvent(String),

    #[error("invalid {kind} data: {source}")]
    InvalidData {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error(transparent)]
    Api(#[from] Error),
}

impl ReceiverError {
    fn response(&self) -> (StatusCode, &'static str) {
        match self {
            ReceiverError::InvalidEvent(_) => (StatusCode::BAD_REQUEST, "invalid_cloudevent"),
            ReceiverError::InvalidData { .. } | ReceiverError::Missing(_) => {
                (StatusCode::BAD_REQUEST, "invalid_data")
            }
            // Replays of an already applied command need no retry.
            ReceiverError::Api(e) if e.is_conflict() || e.is_already_exists() => {
                (StatusCode::ACCEPTED, "conflict")
            }
            ReceiverError::Api(_) => (StatusCode::INTERNAL_SERVER_ERROR, "processing_failed"),
        }
    }
}

/// Reads an event in structured mode (`application/cloudevents+json` body)
/// or binary mode (`ce-*` headers, payload in the body).
pub fn parse_event(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, ReceiverError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with(STRUCTURED_CONTENT_TYPE) {
        return serde_json::from_slice(body).map_err(|e| ReceiverError::InvalidEvent(e.to_string()));
    }

    let attr = |name: &str| -> Option<String> {
        headers
            .get(format!("ce-{name}"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let required = |name: &'static str| {
        attr(name).ok_or_else(|| ReceiverError::InvalidEvent(format!("missing ce-{name} header")))
    };

    let data = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned())),
        )
    };

    Ok(CloudEvent {
        id: required("id")?,
        source: required("source")?,
        specversion: required("specversion")?,
        kind: required("type")?,
        subject: attr("subject"),
        datacontenttype: (!content_type.is_empty()).then(|| content_type.to_string()),
        data,
    })
}

#[derive(Debug, Deserialize)]
pub struct FunctionDeploy {
    pub metadata: FunctionMetadata,
    pub spec: LambdaFunctionSpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunctionMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceDelete {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// What an event asks the receiver to do.
#[derive(Debug)]
pub enum Command {
    Apply(Box<LambdaFunction>),
    Delete { namespace: String, name: String },
    Invocation { function: String, namespace: String, success: bool },
    Ignore,
}

fn data_as<T: for<'de> Deserialize<'de>>(event: &CloudEvent, kind: &'static str) -> Result<T, ReceiverError> {
    let data = event.data.clone().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|source| ReceiverError::InvalidData { kind, source })
}

pub fn command(event: &CloudEvent, default_namespace: &str) -> Result<Command, ReceiverError> {
    let namespace_or_default = |ns: Option<String>| {
        ns.filter(|n| !n.is_empty())
            .unwrap_or_else(|| default_namespace.to_string())
    };

    match event.kind.as_str() {
        FUNCTION_DEPLOY | SERVICE_CREATE | SERVICE_UPDATE => {
            let deploy: FunctionDeploy = data_as(event, "function deploy")?;
            if deploy.metadata.name.is_empty() {
                return Err(ReceiverError::Missing("metadata.name"));
            }
            if deploy.spec.source.r#type.as_deref().unwrap_or_default().is_empty() {
                return Err(ReceiverError::Missing("spec.source.type"));
            }

            let mut lf = LambdaFunction::new(&deploy.metadata.name, deploy.spec);
            lf.metadata.namespace = Some(namespace_or_default(deploy.metadata.namespace));
            lf.metadata.labels = Some(deploy.metadata.labels);
            let mut annotations = deploy.metadata.annotations;
            annotations.insert(EVENT_ID_ANNOTATION.into(), event.id.clone());
            annotations.insert(EVENT_SOURCE_ANNOTATION.into(), event.source.clone());
            lf.metadata.annotations = Some(annotations);
            Ok(Command::Apply(Box::new(lf)))
        }
        SERVICE_DELETE => {
            let delete: ServiceDelete = data_as(event, "service delete")?;
            let name = Some(delete.name)
                .filter(|n| !n.is_empty())
                .or_else(|| event.subject.clone())
                .filter(|n| !n.is_empty())
                .ok_or(ReceiverError::Missing("name"))?;
            if let Some(reason) = delete.reason.as_deref() {
                debug!(%name, reason, "delete requested");
            }
            Ok(Command::Delete {
                namespace: namespace_or_default(delete.namespace),
                name,
            })
        }
        RESPONSE_SUCCESS | RESPONSE_ERROR => {
            // Malformed response payloads only cost a metric sample.
            let response: InvocationResponse = match data_as(event, "response") {
                Ok(r) => r,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "skipping response event");
                    return Ok(Command::Ignore);
                }
            };
            Ok(Command::Invocation {
                function: response.function_name,
                namespace: namespace_or_default(response.namespace),
                success: event.kind == RESPONSE_SUCCESS,
            })
        }
        other => {
            debug!(event_type = other, "ignoring unhandled event type");
            Ok(Command::Ignore)
        }
    }
}

/// Writes commanded changes to `LambdaFunction` resources.
#[async_trait]
pub trait FunctionCommands: Send + Sync {
    /// Creates the function, or replaces the spec of an existing one while
    /// merging labels and annotations.
    async fn apply(&self, lf: &LambdaFunction) -> Result<Outcome, Error>;

    /// Idempotent; a missing function is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<Outcome, Error>;
}

pub struct KubeCommands {
    client: Client,
}

impl KubeCommands {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FunctionCommands for KubeCommands {
    async fn apply(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
        let ns = lf
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<LambdaFunction> = Api::namespaced(self.client.clone(), &ns);

        match api.get_opt(&lf.name_any()).await? {
            Some(mut existing) => {
                existing.spec = lf.spec.clone();
                existing.labels_mut().extend(lf.labels().clone());
                existing.annotations_mut().extend(lf.annotations().clone());
                // Carries the read resource version, so a concurrent edit conflicts.
                api.replace(&lf.name_any(), &PostParams::default(), &existing)
                    .await?;
                Ok(Outcome::Updated)
            }
            None => {
                api.create(&PostParams::default(), lf).await?;
                Ok(Outcome::Created)
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<Outcome, Error> {
        let api: Api<LambdaFunction> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(Outcome::Updated),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() { Ok(Outcome::NoOp) } else { Err(err) }
            }
        }
    }
}

#[derive(Clone)]
pub struct ReceiverState {
    pub commands: Arc<dyn FunctionCommands>,
    pub metrics: Metrics,
    pub default_namespace: String,
    /// Flipped once the listener is bound.
    pub ready: Arc<AtomicBool>,
}

impl ReceiverState {
    pub fn new(commands: Arc<dyn FunctionCommands>, metrics: Metrics, config: &ReceiverConfig) -> Self {
        Self {
            commands,
            metrics,
            default_namespace: config.default_namespace.clone(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/events", post(receive))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn receive(State(state): State<ReceiverState>, headers: HeaderMap, body: Bytes) -> Response {
    let correlation_id = headers
        .get(&CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let event = match parse_event(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            warn!(%correlation_id, error = %e, "rejecting request");
            state.metrics.record_cloudevent("invalid", "rejected");
            return reply(
                StatusCode::BAD_REQUEST,
                &correlation_id,
                json!({
                    "status": "error",
                    "error": "invalid_cloudevent",
                    "message": e.to_string(),
                    "correlationId": correlation_id,
                }),
            );
        }
    };
    info!(
        event_id = %event.id,
        event_type = %event.kind,
        event_source = %event.source,
        %correlation_id,
        "CloudEvent received"
    );

    match dispatch(&state, &event).await {
        Ok(()) => {
            state.metrics.record_cloudevent(&event.kind, "processed");
            reply(
                StatusCode::ACCEPTED,
                &correlation_id,
                json!({ "status": "accepted", "eventId": event.id, "correlationId": correlation_id }),
            )
        }
        Err(e) => {
            let (status, label) = e.response();
            if status == StatusCode::ACCEPTED {
                debug!(event_id = %event.id, error = %e, "command already applied");
                state.metrics.record_cloudevent(&event.kind, "processed");
                return reply(
                    status,
                    &correlation_id,
                    json!({ "status": "accepted", "eventId": event.id, "correlationId": correlation_id }),
                );
            }
            error!(event_id = %event.id, event_type = %event.kind, error = %e, "processing CloudEvent failed");
            state.metrics.record_cloudevent(&event.kind, "failed");
            reply(
                status,
                &correlation_id,
                json!({
                    "status": "error",
                    "eventId": event.id,
                    "eventType": event.kind,
                    "error": label,
                    "message": e.to_string(),
                    "correlationId": correlation_id,
                }),
            )
        }
    }
}

async fn dispatch(state: &ReceiverState, event: &CloudEvent) -> Result<(), ReceiverError> {
    match command(event, &state.default_namespace)? {
        Command::Apply(lf) => {
            let outcome = state.commands.apply(&lf).await?;
            info!(name = %lf.name_any(), namespace = ?lf.namespace(), ?outcome, "function applied");
        }
        Command::Delete { namespace, name } => {
            let outcome = state.commands.delete(&namespace, &name).await?;
            info!(%name, %namespace, ?outcome, "function deleted");
        }
        Command::Invocation { function, namespace, success } => {
            state.metrics.record_invocation(&function, &namespace, success);
        }
        Command::Ignore => {}
    }
    Ok(())
}

fn reply(status: StatusCode, correlation_id: &str, body: Value) -> Response {
    (
        status,
        [(CORRELATION_HEADER, correlation_id.to_string())],
        Json(body),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn ready(State(state): State<ReceiverState>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        Json(json!({ "status": "ready" })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "starting" }))).into_response()
    }
}

async fn metrics(State(state): State<ReceiverState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!(error = %e, "encoding metrics failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn serve(addr: SocketAddr, state: ReceiverState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    state.ready.store(true, Ordering::SeqCst);
    info!(%addr, "CloudEvents receiver listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCommands {
        calls: Mutex<Vec<String>>,
        fail_with: Mutex<Option<Error>>,
    }

    impl FakeCommands {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn take_failure(&self) -> Result<(), Error> {
            match self.fail_with.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl FunctionCommands for FakeCommands {
        async fn apply(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
            self.take_failure()?;
            self.calls.lock().unwrap().push(format!(
                "apply {}/{}",
                lf.namespace().unwrap_or_default(),
                lf.name_any()
            ));
            Ok(Outcome::Created)
        }

        async fn delete(&self, namespace: &str, name: &str) -> Result<Outcome, Error> {
            self.take_failure()?;
            self.calls.lock().unwrap().push(format!("delete {namespace}/{name}"));
            Ok(Outcome::Updated)
        }
    }

    fn state(commands: Arc<FakeCommands>) -> ReceiverState {
        ReceiverState::new(commands, Metrics::new().unwrap(), &ReceiverConfig::default())
    }

    fn binary_headers(kind: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("ce-id", HeaderValue::from_static("evt-1"));
        headers.insert("ce-source", HeaderValue::from_static("/tests"));
        headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
        headers.insert("ce-type", HeaderValue::from_str(kind).unwrap());
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    async fn body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn deploy_payload() -> Value {
        json!({
            "metadata": { "name": "hello", "labels": { "team": "a" } },
            "spec": {
                "source": { "type": "inline", "inline": { "code": "def handler(e): return e" } },
                "runtime": { "language": "python", "version": "3.12" }
            }
        })
    }

    #[test]
    fn parses_binary_and_structured_modes() {
        let headers = binary_headers(FUNCTION_DEPLOY);
        let event = parse_event(&headers, br#"{"a":1}"#).unwrap();
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.kind, FUNCTION_DEPLOY);
        assert_eq!(event.data, Some(json!({ "a": 1 })));

        let mut structured = HeaderMap::new();
        structured.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/cloudevents+json; charset=utf-8"),
        );
        let body = json!({
            "id": "evt-2", "source": "/s", "specversion": "1.0",
            "type": SERVICE_DELETE, "subject": "hello", "data": {}
        });
        let event = parse_event(&structured, body.to_string().as_bytes()).unwrap();
        assert_eq!(event.kind, SERVICE_DELETE);
        assert_eq!(event.subject.as_deref(), Some("hello"));

        let mut missing = binary_headers(FUNCTION_DEPLOY);
        missing.remove("ce-source");
        let err = parse_event(&missing, b"").unwrap_err();
        assert_eq!(err.to_string(), "invalid CloudEvent: missing ce-source header");
    }

    #[test]
    fn deploy_command_builds_function_in_default_namespace() {
        let headers = binary_headers(FUNCTION_DEPLOY);
        let event = parse_event(&headers, deploy_payload().to_string().as_bytes()).unwrap();

        let Command::Apply(lf) = command(&event, "knative-lambda").unwrap() else {
            panic!("expected apply");
        };
        assert_eq!(lf.name_any(), "hello");
        assert_eq!(lf.namespace().as_deref(), Some("knative-lambda"));
        assert_eq!(lf.labels().get("team").map(String::as_str), Some("a"));
        assert_eq!(lf.annotations().get(EVENT_ID_ANNOTATION).map(String::as_str), Some("evt-1"));
        assert_eq!(lf.spec.runtime.language, "python");
    }

    #[test]
    fn deploy_command_requires_name_and_source_type() {
        let headers = binary_headers(SERVICE_CREATE);
        let mut payload = deploy_payload();
        payload["metadata"]["name"] = json!("");
        let event = parse_event(&headers, payload.to_string().as_bytes()).unwrap();
        assert!(matches!(command(&event, "ns"), Err(ReceiverError::Missing("metadata.name"))));

        let mut payload = deploy_payload();
        payload["spec"]["source"] = json!({});
        let event = parse_event(&headers, payload.to_string().as_bytes()).unwrap();
        assert!(matches!(command(&event, "ns"), Err(ReceiverError::Missing("spec.source.type"))));
    }

    #[test]
    fn delete_falls_back_to_subject() {
        let mut headers = binary_headers(SERVICE_DELETE);
        headers.insert("ce-subject", HeaderValue::from_static("hello"));
        let event = parse_event(&headers, br#"{"namespace":"team-a"}"#).unwrap();
        let Command::Delete { namespace, name } = command(&event, "ns").unwrap() else {
            panic!("expected delete");
        };
        assert_eq!((namespace.as_str(), name.as_str()), ("team-a", "hello"));
    }

    #[tokio::test]
    async fn accepted_command_echoes_correlation_id() {
        let commands = Arc::new(FakeCommands::default());
        let mut headers = binary_headers(FUNCTION_DEPLOY);
        headers.insert(&CORRELATION_HEADER, HeaderValue::from_static("corr-7"));

        let resp = receive(
            State(state(commands.clone())),
            headers,
            Bytes::from(deploy_payload().to_string()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers().get(&CORRELATION_HEADER).unwrap(), "corr-7");
        let json = body(resp).await;
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["eventId"], "evt-1");
        assert_eq!(commands.calls(), ["apply knative-lambda/hello"]);
    }

    #[tokio::test]
    async fn status_codes_follow_failure_kind() {
        let commands = Arc::new(FakeCommands::default());

        let resp = receive(State(state(commands.clone())), HeaderMap::new(), Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.headers().contains_key(&CORRELATION_HEADER));
        assert_eq!(body(resp).await["error"], "invalid_cloudevent");

        let resp = receive(
            State(state(commands.clone())),
            binary_headers(FUNCTION_DEPLOY),
            Bytes::from_static(b"{}"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(resp).await["error"], "invalid_data");

        *commands.fail_with.lock().unwrap() = Some(Error::Conflict("knative-lambda/hello".into()));
        let resp = receive(
            State(state(commands.clone())),
            binary_headers(FUNCTION_DEPLOY),
            Bytes::from(deploy_payload().to_string()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        *commands.fail_with.lock().unwrap() = Some(Error::Config("api down".into()));
        let resp = receive(
            State(state(commands.clone())),
            binary_headers(SERVICE_DELETE),
            Bytes::from_static(br#"{"name":"hello"}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await["error"], "processing_failed");
        assert!(commands.calls().is_empty());
    }

    #[tokio::test]
    async fn response_events_count_invocations_and_unknown_types_are_acknowledged() {
        let commands = Arc::new(FakeCommands::default());
        let st = state(commands.clone());

        let resp = receive(
            State(st.clone()),
            binary_headers(RESPONSE_ERROR),
            Bytes::from_static(br#"{"functionName":"hello","namespace":"team-a"}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = receive(
            State(st.clone()),
            binary_headers("com.example.unrelated"),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let text = st.metrics.encode().unwrap();
        assert!(text.contains(
            r#"knative_lambda_operator_function_invocations_total{function="hello",namespace="team-a",result="error"} 1"#
        ));
        assert!(text.contains(
            r#"knative_lambda_operator_cloudevents_total{result="processed",type="com.example.unrelated"} 1"#
        ));
        assert!(commands.calls().is_empty());
    }

    #[tokio::test]
    async fn readiness_follows_the_flag() {
        let st = state(Arc::new(FakeCommands::default()));
        assert_eq!(ready(State(st.clone())).await.status(), StatusCode::SERVICE_UNAVAILABLE);
        st.ready.store(true, Ordering::SeqCst);
        assert_eq!(ready(State(st)).await.status(), StatusCode::OK);
        assert_eq!(health().await.0["status"], "healthy");
    }
}
