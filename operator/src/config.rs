use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::Error;

pub const RECEIVER_IMAGE_NAME: &str = "knative-lambda-operator";

/// Operator settings: built-in defaults, then an optional file, then the
/// environment (`LAMBDA_` prefix, `__` between nested keys, e.g.
/// `LAMBDA_BUILD__PUSH_REGISTRY`). `OPERATOR_REGISTRY`, `OPERATOR_VERSION`,
/// `POD_NAMESPACE`, `PORT` and `FUNCTION_NAMESPACE` are read without the prefix.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub build: BuildConfig,
    pub deploy: DeployConfig,
    pub eventing: EventingConfig,
    pub notifications: NotificationConfig,
    pub server: ServerConfig,
    pub receiver: ReceiverConfig,
    /// Registry the operator's own image is pulled from in receiver mode.
    pub operator_registry: String,
    pub operator_version: Option<String>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            build: BuildConfig::default(),
            deploy: DeployConfig::default(),
            eventing: EventingConfig::default(),
            notifications: NotificationConfig::default(),
            server: ServerConfig::default(),
            receiver: ReceiverConfig::default(),
            operator_registry: "localhost:5001".into(),
            operator_version: None,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix("LAMBDA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override_option("operator_registry", std::env::var("OPERATOR_REGISTRY").ok())?
            .set_override_option("operator_version", std::env::var("OPERATOR_VERSION").ok())?
            .set_override_option("controller.lease_namespace", std::env::var("POD_NAMESPACE").ok())?
            .set_override_option("receiver.port", std::env::var("PORT").ok())?
            .set_override_option(
                "receiver.default_namespace",
                std::env::var("FUNCTION_NAMESPACE").ok(),
            )?
            .build()?
            .try_deserialize()
    }

    /// Image a receiver-mode function runs: the operator's own build.
    pub fn receiver_image(&self) -> Result<String, Error> {
        let version = self
            .operator_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config("OPERATOR_VERSION is not set".into()))?;
        let registry = self.operator_registry.trim_end_matches('/');
        Ok(format!("{registry}/{RECEIVER_IMAGE_NAME}:{version}"))
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ControllerConfig {
    /// Upper bound on concurrently reconciled functions.
    pub concurrency: u16,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub requeue_short_secs: u64,
    pub requeue_medium_secs: u64,
    pub requeue_long_secs: u64,
    /// Reconcile only while holding the leader Lease.
    pub leader_elect: bool,
    pub lease_name: String,
    /// Defaults to the pod's namespace, then `default`.
    pub lease_namespace: Option<String>,
    pub lease_duration_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            namespace: None,
            requeue_short_secs: 15,
            requeue_medium_secs: 60,
            requeue_long_secs: 300,
            leader_elect: false,
            lease_name: "lambda-operator-leader".into(),
            lease_namespace: None,
            lease_duration_secs: 15,
        }
    }
}

impl ControllerConfig {
    pub fn short(&self) -> Duration {
        Duration::from_secs(self.requeue_short_secs)
    }

    pub fn medium(&self) -> Duration {
        Duration::from_secs(self.requeue_medium_secs)
    }

    pub fn long(&self) -> Duration {
        Duration::from_secs(self.requeue_long_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(3))
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BuildConfig {
    pub push_registry: String,
    /// Registry nodes pull from when it differs from the push side (e.g. in-cluster vs. host port).
    pub pull_registry: Option<String>,
    /// Rootless BuildKit image; must ship `buildctl-daemonless.sh`.
    pub builder_image: String,
    pub helper_image: String,
    pub git_image: String,
    pub aws_cli_image: String,
    pub gcloud_image: String,
    /// Used when a minio source names no endpoint.
    pub minio_endpoint: String,
    pub timeout_seconds: i64,
    pub ttl_seconds_after_finished: i32,
    pub cache: bool,
    pub cache_repo: Option<String>,
    pub insecure_registry: bool,
    pub service_account: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            push_registry: "localhost:5001".into(),
            pull_registry: None,
            builder_image: "moby/buildkit:v0.16.0-rootless".into(),
            helper_image: "alpine:3.19".into(),
            git_image: "alpine/git:2.45.2".into(),
            aws_cli_image: "amazon/aws-cli:2.17.0".into(),
            gcloud_image: "google/cloud-sdk:alpine".into(),
            minio_endpoint: "minio.minio.svc.cluster.local:9000".into(),
            timeout_seconds: 900,
            ttl_seconds_after_finished: 300,
            cache: false,
            cache_repo: None,
            insecure_registry: false,
            service_account: None,
        }
    }
}

impl BuildConfig {
    pub fn pull_registry(&self) -> &str {
        self.pull_registry.as_deref().unwrap_or(&self.push_registry)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DeployConfig {
    pub function_service_account: String,
    pub receiver_service_account: String,
    pub port: i32,
    pub min_scale: i32,
    pub max_scale: i32,
    pub target_concurrency: i32,
    pub request_cpu: String,
    pub request_memory: String,
    pub limit_cpu: String,
    pub limit_memory: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            function_service_account: "knative-lambda-function".into(),
            receiver_service_account: "knative-lambda-receiver".into(),
            port: 8080,
            min_scale: 0,
            max_scale: 50,
            target_concurrency: 10,
            request_cpu: "50m".into(),
            request_memory: "64Mi".into(),
            limit_cpu: "100m".into(),
            limit_memory: "128Mi".into(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EventingConfig {
    pub broker_name: String,
    pub broker_class: Option<String>,
    pub parallelism: u32,
    pub retry: i32,
    pub backoff_policy: String,
    pub backoff_delay: String,
}

impl Default for EventingConfig {
    fn default() -> Self {
        Self {
            broker_name: "lambda-broker".into(),
            broker_class: None,
            parallelism: 50,
            retry: 5,
            backoff_policy: "exponential".into(),
            backoff_delay: "PT1S".into(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NotificationConfig {
    pub kube_events: bool,
    /// CloudEvents endpoint; unset disables the HTTP sink.
    pub sink_url: Option<String>,
    pub source: String,
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            kube_events: true,
            sink_url: None,
            source: "knative-lambda-operator".into(),
            timeout_secs: 5,
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Settings of the CloudEvents receiver (`--mode=receiver`).
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Knative injects `PORT`.
    pub port: u16,
    /// Namespace for commands that do not name one.
    pub default_namespace: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            default_namespace: "knative-lambda".into(),
        }
    }
}

impl ReceiverConfig {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_requeue_tiers() {
        let cfg = Config::default();
        assert_eq!(cfg.controller.short(), Duration::from_secs(15));
        assert_eq!(cfg.controller.medium(), Duration::from_secs(60));
        assert_eq!(cfg.controller.long(), Duration::from_secs(300));
        assert_eq!(cfg.controller.concurrency, 50);
        assert_eq!(cfg.eventing.broker_name, "lambda-broker");
        assert_eq!(cfg.build.pull_registry(), "localhost:5001");
        assert!(!cfg.controller.leader_elect);
        assert_eq!(cfg.controller.lease_duration(), Duration::from_secs(15));
        assert_eq!(cfg.receiver.address(), SocketAddr::from(([0, 0, 0, 0], 8080)));
    }

    #[test]
    fn receiver_image_requires_version() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.receiver_image(), Err(Error::Config(_))));

        cfg.operator_version = Some("1.4.2".into());
        cfg.operator_registry = "registry.local:5000/".into();
        assert_eq!(
            cfg.receiver_image().unwrap(),
            "registry.local:5000/knative-lambda-operator:1.4.2"
        );
    }

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("lambda-operator-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "controller:\n  concurrency: 8\n  requeue_long_secs: 600\n  leader_elect: true\nbuild:\n  push_registry: registry.svc:5000\n  pull_registry: localhost:5001\nlog_format: json\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.controller.concurrency, 8);
        assert_eq!(cfg.controller.long(), Duration::from_secs(600));
        assert_eq!(cfg.controller.requeue_short_secs, 15);
        assert!(cfg.controller.leader_elect);
        assert_eq!(cfg.controller.lease_name, "lambda-operator-leader");
        assert_eq!(cfg.build.push_registry, "registry.svc:5000");
        assert_eq!(cfg.build.pull_registry(), "localhost:5001");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }
}
