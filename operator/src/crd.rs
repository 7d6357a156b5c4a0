use std::collections::BTreeMap;
use std::fmt;

use chrono::{SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Legacy annotation that switches a function into receiver mode.
pub const USE_OPERATOR_IMAGE_ANNOTATION: &str = "lambda.knative.io/use-operator-image";
pub const NAME_LABEL: &str = "lambda.knative.io/name";
pub const MANAGED_BY: &str = "lambda-operator";
pub const DEFAULT_HANDLER: &str = "main.handler";

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lambda.knative.io",
    version = "v1alpha1",
    kind = "LambdaFunction",
    plural = "lambdafunctions",
    derive = "Default",
    status = "LambdaFunctionStatus",
    shortname = "lf",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.serviceStatus.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct LambdaFunctionSpec {
    pub source: SourceSpec,
    pub runtime: RuntimeSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,

    #[serde(default)]
    pub scaling: Option<ScalingSpec>,

    #[serde(default)]
    pub resources: Option<ResourceSpec>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub eventing: Option<EventingSpec>,

    #[serde(default)]
    pub build: Option<BuildSpec>,

    #[serde(default)]
    pub image_pull_policy: Option<String>,
}

/// Wire form of the source union. `type` selects which block is read.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub minio: Option<MinioSource>,
    #[serde(default)]
    pub s3: Option<S3Source>,
    #[serde(default)]
    pub gcs: Option<GcsSource>,
    #[serde(default)]
    pub git: Option<GitSource>,
    #[serde(default)]
    pub inline: Option<InlineSource>,
    #[serde(default)]
    pub image: Option<ImageSource>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MinioSource {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSource {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secret_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineSource {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub dependencies: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

impl ImageSource {
    /// Digest wins over tag; with neither the reference defaults to `:latest`.
    pub fn reference(&self) -> String {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_owned);
        match (non_empty(&self.digest), non_empty(&self.tag)) {
            (Some(digest), _) => format!("{}@{}", self.repository, digest),
            (None, Some(tag)) => format!("{}:{}", self.repository, tag),
            (None, None) => format!("{}:latest", self.repository),
        }
    }
}

/// Closed view over [`SourceSpec`] after the `type` tag has been checked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source<'a> {
    Minio(&'a MinioSource),
    S3(&'a S3Source),
    Gcs(&'a GcsSource),
    Git(&'a GitSource),
    Inline(&'a InlineSource),
    Image(&'a ImageSource),
}

impl Source<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Minio(_) => "minio",
            Source::S3(_) => "s3",
            Source::Gcs(_) => "gcs",
            Source::Git(_) => "git",
            Source::Inline(_) => "inline",
            Source::Image(_) => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source type is required")]
    MissingType,
    #[error("{0} configuration is required for source type '{0}'")]
    MissingBlock(&'static str),
    #[error("unsupported source type: {0}")]
    Unsupported(String),
}

impl SourceSpec {
    pub fn resolve(&self) -> Result<Source<'_>, SourceError> {
        fn block<'a, T>(kind: &'static str, b: &'a Option<T>) -> Result<&'a T, SourceError> {
            b.as_ref().ok_or(SourceError::MissingBlock(kind))
        }

        match self.r#type.as_deref().map(str::trim) {
            None | Some("") => Err(SourceError::MissingType),
            Some("minio") => block("minio", &self.minio).map(Source::Minio),
            Some("s3") => block("s3", &self.s3).map(Source::S3),
            Some("gcs") => block("gcs", &self.gcs).map(Source::Gcs),
            Some("git") => block("git", &self.git).map(Source::Git),
            Some("inline") => block("inline", &self.inline).map(Source::Inline),
            Some("image") => block("image", &self.image).map(Source::Image),
            Some(other) => Err(SourceError::Unsupported(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub handler: Option<String>,
}

impl RuntimeSpec {
    pub fn handler(&self) -> &str {
        self.handler
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HANDLER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Node,
    Go,
}

impl Language {
    pub fn parse(language: &str) -> Option<Self> {
        match language.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" => Some(Language::Python),
            "nodejs" | "node" | "javascript" => Some(Language::Node),
            "go" | "golang" => Some(Language::Go),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Node => "nodejs",
            Language::Go => "go",
        }
    }
}

/// How the image that ends up in the service is obtained.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStrategy {
    /// Build an image from the source with a build task.
    #[default]
    Build,
    /// Deploy the image named by an `image` source as is.
    #[serde(rename = "image")]
    PrebuiltImage,
    /// Run the operator's own image as a CloudEvents receiver.
    Receiver,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::Build => "build",
            DeploymentStrategy::PrebuiltImage => "image",
            DeploymentStrategy::Receiver => "receiver",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    pub min_replicas: Option<i32>,
    pub max_replicas: Option<i32>,
    pub target_concurrency: Option<i32>,
    pub container_concurrency: Option<i64>,
    pub scale_to_zero_grace_period: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub limits: Option<ResourceLimits>,
    pub requests: Option<ResourceLimits>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: Option<KeyRef>,
    pub config_map_key_ref: Option<KeyRef>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventingSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub broker_name: Option<String>,
    /// Extra CloudEvent attributes the trigger filters on, next to `subject`.
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub delivery: Option<DeliverySpec>,
}

impl Default for EventingSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            broker_name: None,
            filter: BTreeMap::new(),
            parallelism: None,
            delivery: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySpec {
    pub retry: Option<i32>,
    pub backoff_policy: Option<String>,
    pub backoff_delay: Option<String>,
    pub dead_letter_uri: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub registry: Option<String>,
    pub repository: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub cache: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema, Default)]
pub enum Phase {
    #[default]
    Pending,
    Building,
    Deploying,
    Ready,
    Failed,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Building => "Building",
            Phase::Deploying => "Deploying",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
            Phase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    SourceReady,
    BuildReady,
    DeployReady,
    ServiceReady,
    EventingReady,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::SourceReady => "SourceReady",
            ConditionType::BuildReady => "BuildReady",
            ConditionType::DeployReady => "DeployReady",
            ConditionType::ServiceReady => "ServiceReady",
            ConditionType::EventingReady => "EventingReady",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LambdaFunctionStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub build_status: Option<BuildStatus>,
    #[serde(default)]
    pub service_status: Option<ServiceStatus>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub task_name: Option<String>,
    pub image_uri: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    #[serde(default)]
    pub attempt: i32,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service_name: String,
    pub url: Option<String>,
    #[serde(default)]
    pub ready: bool,
    /// Replicas of the latest ready revision; unknown until it reports them.
    #[serde(default)]
    pub replicas: Option<i32>,
    pub latest_revision: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<String>,
}

impl LambdaFunctionStatus {
    /// Replaces the condition of the same type in place or appends a new one.
    /// The transition time only moves when the status flips.
    pub fn set_condition(
        &mut self,
        kind: ConditionType,
        ready: bool,
        reason: &str,
        message: impl Into<String>,
    ) {
        let status = if ready { "True" } else { "False" };
        let message = message.into();

        match self.conditions.iter_mut().find(|c| c.r#type == kind.as_str()) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Some(timestamp());
                }
                existing.status = status.into();
                existing.reason = Some(reason.into());
                existing.message = Some(message);
            }
            None => self.conditions.push(Condition {
                r#type: kind.as_str().into(),
                status: status.into(),
                reason: Some(reason.into()),
                message: Some(message),
                last_transition_time: Some(timestamp()),
            }),
        }
    }

    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == kind.as_str())
    }
}

impl LambdaFunction {
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }

    /// True when the function spec changed since the pipeline last committed to it.
    pub fn spec_changed(&self) -> bool {
        self.observed_generation() != Some(self.generation())
    }

    /// Explicit `spec.strategy` wins; the legacy receiver annotation is honoured next.
    pub fn strategy(&self) -> DeploymentStrategy {
        if let Some(strategy) = self.spec.strategy {
            return strategy;
        }
        let receiver = self
            .annotations()
            .get(USE_OPERATOR_IMAGE_ANNOTATION)
            .is_some_and(|v| v == "true");
        if receiver {
            DeploymentStrategy::Receiver
        } else if self.spec.source.r#type.as_deref() == Some("image") {
            DeploymentStrategy::PrebuiltImage
        } else {
            DeploymentStrategy::Build
        }
    }

    pub fn eventing_enabled(&self) -> bool {
        self.spec.eventing.as_ref().is_none_or(|e| e.enabled)
    }

    pub fn status_mut(&mut self) -> &mut LambdaFunctionStatus {
        self.status.get_or_insert_with(LambdaFunctionStatus::default)
    }
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn default_true() -> bool {
    true
}
