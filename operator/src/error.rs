use kube::Error as KubeError;
use thiserror::Error;

use crate::crd::SourceError;
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] KubeError),

    #[error("invalid function spec: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid source: {0}")]
    Source(#[from] SourceError),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("build context error: {0}")]
    BuildContext(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("notification error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// 404 from the API server, or a fake reporting the same.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(KubeError::Api(resp)) => resp.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    /// 409 caused by a stale resource version.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube(KubeError::Api(resp)) => resp.code == 409 && resp.reason != "AlreadyExists",
            Error::Conflict(_) => true,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Kube(KubeError::Api(resp)) => resp.code == 409 && resp.reason == "AlreadyExists",
            Error::AlreadyExists { .. } => true,
            _ => false,
        }
    }

    /// Short label for the `errors_total` metric.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube_api",
            Error::Validation(_) | Error::Source(_) => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::AlreadyExists { .. } => "already_exists",
            Error::MissingObjectKey(_) => "missing_key",
            Error::Config(_) => "config",
            Error::BuildContext(_) => "build_context",
            Error::Serialization(_) => "serialization",
            Error::Http(_) => "http",
            Error::Metrics(_) => "metrics",
        }
    }
}
