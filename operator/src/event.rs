use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType};
use kube::{Client, Resource};
use kube_runtime::events::{Recorder, Reporter};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::crd::{LambdaFunction, timestamp};
use crate::error::Error;
use crate::metrics::Metrics;

const CLOUD_EVENT_PREFIX: &str = "io.knative.lambda.lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NoOp,
    Created,
    Updated,
}

/// Lifecycle milestones worth telling a human about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BuildStarted { task: String },
    BuildCompleted { image: String },
    BuildFailed { error: String },
    ServiceCreated { image: String },
    ServiceDeleted,
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BuildStarted { .. } => "BuildStarted",
            Notification::BuildCompleted { .. } => "BuildCompleted",
            Notification::BuildFailed { .. } => "BuildFailed",
            Notification::ServiceCreated { .. } => "ServiceCreated",
            Notification::ServiceDeleted => "ServiceDeleted",
        }
    }

    pub fn note(&self) -> String {
        match self {
            Notification::BuildStarted { task } => format!("Started build task {task}"),
            Notification::BuildCompleted { image } => format!("Built image {image}"),
            Notification::BuildFailed { error } => format!("Build failed: {error}"),
            Notification::ServiceCreated { image } => format!("Created service running {image}"),
            Notification::ServiceDeleted => "Deleted service".into(),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Notification::BuildFailed { .. } => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    pub fn cloud_event_type(&self) -> String {
        let suffix = match self {
            Notification::BuildStarted { .. } => "build.started",
            Notification::BuildCompleted { .. } => "build.completed",
            Notification::BuildFailed { .. } => "build.failed",
            Notification::ServiceCreated { .. } => "service.created",
            Notification::ServiceDeleted => "service.deleted",
        };
        format!("{CLOUD_EVENT_PREFIX}.{suffix}")
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, subject: &ObjectReference, notification: &Notification) -> Result<(), Error>;
}

pub fn make_reporter() -> Reporter {
    Reporter {
        controller: "lambda-operator".into(),
        instance: std::env::var("POD_NAME").ok(),
    }
}

/// Publishes notifications as Kubernetes Events on the function.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client, make_reporter()),
        }
    }
}

#[async_trait]
impl NotificationSink for KubeEventSink {
    async fn send(&self, subject: &ObjectReference, notification: &Notification) -> Result<(), Error> {
        self.recorder
            .publish(
                &Event {
                    type_: notification.event_type(),
                    reason: notification.kind().into(),
                    note: Some(notification.note()),
                    action: notification.kind().into(),
                    secondary: None,
                },
                subject,
            )
            .await?;
        Ok(())
    }
}

/// Posts notifications as binary-mode CloudEvents.
pub struct CloudEventSink {
    http: reqwest::Client,
    url: String,
    source: String,
}

impl CloudEventSink {
    pub fn new(url: impl Into<String>, source: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
            source: source.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for CloudEventSink {
    async fn send(&self, subject: &ObjectReference, notification: &Notification) -> Result<(), Error> {
        let namespace = subject.namespace.as_deref().unwrap_or_default();
        let name = subject.name.as_deref().unwrap_or_default();

        self.http
            .post(&self.url)
            .header("ce-specversion", "1.0")
            .header("ce-id", Uuid::new_v4().to_string())
            .header("ce-type", notification.cloud_event_type())
            .header("ce-source", format!("{}/{namespace}/{name}", self.source))
            .header("ce-subject", format!("{namespace}/{name}"))
            .header("ce-time", timestamp())
            .json(&json!({
                "namespace": namespace,
                "name": name,
                "reason": notification.kind(),
                "message": notification.note(),
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fans notifications out to every sink on detached tasks. Callers never
/// wait on delivery and never see its errors.
#[derive(Clone)]
pub struct Notifier {
    sinks: Arc<Vec<Arc<dyn NotificationSink>>>,
    metrics: Metrics,
    timeout: Duration,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, metrics: Metrics, timeout: Duration) -> Self {
        Self {
            sinks: Arc::new(sinks),
            metrics,
            timeout,
        }
    }

    pub fn from_config(client: Client, cfg: &NotificationConfig, metrics: Metrics) -> Result<Self, Error> {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if cfg.kube_events {
            sinks.push(Arc::new(KubeEventSink::new(client)));
        }
        if let Some(url) = cfg.sink_url.as_deref().filter(|u| !u.is_empty()) {
            sinks.push(Arc::new(CloudEventSink::new(url, cfg.source.clone(), cfg.timeout())?));
        }
        Ok(Self::new(sinks, metrics, cfg.timeout()))
    }

    pub fn notify(&self, lf: &LambdaFunction, notification: Notification) {
        let subject = lf.object_ref(&());
        for sink in self.sinks.iter().cloned() {
            let subject = subject.clone();
            let notification = notification.clone();
            let metrics = self.metrics.clone();
            let timeout = self.timeout;

            tokio::spawn(async move {
                let kind = notification.kind();
                let delivered = match tokio::time::timeout(timeout, sink.send(&subject, &notification)).await {
                    Ok(Ok(())) => {
                        debug!(notification = kind, name = ?subject.name, "notification delivered");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(notification = kind, name = ?subject.name, error = %e, "notification failed");
                        false
                    }
                    Err(_) => {
                        warn!(notification = kind, name = ?subject.name, "notification timed out");
                        false
                    }
                };
                metrics.record_notification(kind, delivered);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl NotificationSink for Recording {
        async fn send(&self, subject: &ObjectReference, n: &Notification) -> Result<(), Error> {
            self.0
                .lock()
                .unwrap()
                .push((subject.name.clone().unwrap_or_default(), n.kind().to_string()));
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl NotificationSink for Stuck {
        async fn send(&self, _: &ObjectReference, _: &Notification) -> Result<(), Error> {
            std::future::pending().await
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationSink for Broken {
        async fn send(&self, _: &ObjectReference, _: &Notification) -> Result<(), Error> {
            Err(Error::Config("sink unavailable".into()))
        }
    }

    fn function() -> LambdaFunction {
        serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": { "name": "hello", "namespace": "team-a" },
            "spec": {
                "source": { "type": "inline", "inline": { "code": "x" } },
                "runtime": { "language": "python", "version": "3.12" }
            }
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn slow_and_failing_sinks_never_block_the_caller() {
        let metrics = Metrics::new().unwrap();
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let notifier = Notifier::new(
            vec![
                Arc::new(Stuck) as Arc<dyn NotificationSink>,
                Arc::new(Broken),
                recording.clone(),
            ],
            metrics.clone(),
            Duration::from_secs(5),
        );

        notifier.notify(&function(), Notification::ServiceDeleted);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(
            *recording.0.lock().unwrap(),
            vec![("hello".to_string(), "ServiceDeleted".to_string())]
        );
        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"notifications_total{result="failure",type="ServiceDeleted"} 2"#));
        assert!(text.contains(r#"notifications_total{result="success",type="ServiceDeleted"} 1"#));
    }

    #[test]
    fn cloud_event_types_and_severity() {
        let failed = Notification::BuildFailed { error: "exit 1".into() };
        assert_eq!(failed.cloud_event_type(), "io.knative.lambda.lifecycle.build.failed");
        assert!(matches!(failed.event_type(), EventType::Warning));
        assert_eq!(failed.note(), "Build failed: exit 1");

        let started = Notification::BuildStarted { task: "hello-build-1".into() };
        assert_eq!(started.cloud_event_type(), "io.knative.lambda.lifecycle.build.started");
        assert!(matches!(started.event_type(), EventType::Normal));
    }
}
