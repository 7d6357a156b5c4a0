use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::core::gvk::GroupVersionKind;
use kube::{Client, Resource, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::DeployConfig;
use crate::crd::{DeploymentStrategy, EnvVar, LambdaFunction, MANAGED_BY, NAME_LABEL, Source};
use crate::error::Error;
use crate::templates::RUNTIME_USER;

/// Function generation a service was last rendered from.
pub const GENERATION_ANNOTATION: &str = "lambda.knative.io/generation";

const IMAGE_POINTER: &str = "/spec/template/spec/containers/0/image";

pub fn service_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("serving.knative.dev", "v1", "Service"),
        "services",
    )
}

pub fn revision_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("serving.knative.dev", "v1", "Revision"),
        "revisions",
    )
}

/// Readiness and address of a deployed service, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceHealth {
    pub ready: bool,
    pub url: Option<String>,
    /// `status.actualReplicas` of the latest ready revision, when known.
    pub replicas: Option<i32>,
    pub latest_revision: Option<String>,
}

#[async_trait]
pub trait DeployCoordinator: Send + Sync {
    async fn get_service(&self, lf: &LambdaFunction) -> Result<Option<DynamicObject>, Error>;

    async fn create_service(&self, lf: &LambdaFunction, image: &str) -> Result<DynamicObject, Error>;

    /// Re-renders an existing service from the current spec.
    async fn update_service(
        &self,
        lf: &LambdaFunction,
        service: &DynamicObject,
        image: &str,
    ) -> Result<DynamicObject, Error>;

    /// Swaps the image of an existing service in place; written back with the
    /// resource version it was read at.
    async fn update_service_image(
        &self,
        service: &DynamicObject,
        image: &str,
    ) -> Result<DynamicObject, Error>;

    async fn get_service_status(&self, service: &DynamicObject) -> ServiceHealth {
        service_health(service)
    }

    /// Idempotent; a service that is already gone is not an error.
    async fn delete_service(&self, lf: &LambdaFunction) -> Result<(), Error>;
}

pub struct KnativeDeployer {
    client: Client,
    config: DeployConfig,
    resource: ApiResource,
}

impl KnativeDeployer {
    pub fn new(client: Client, config: DeployConfig) -> Self {
        Self {
            client,
            config,
            resource: service_resource(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn namespace_of(lf: &LambdaFunction) -> Result<String, Error> {
    lf.namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

#[async_trait]
impl DeployCoordinator for KnativeDeployer {
    async fn get_service(&self, lf: &LambdaFunction) -> Result<Option<DynamicObject>, Error> {
        let ns = namespace_of(lf)?;
        Ok(self.api(&ns).get_opt(&lf.name_any()).await?)
    }

    async fn create_service(&self, lf: &LambdaFunction, image: &str) -> Result<DynamicObject, Error> {
        let ns = namespace_of(lf)?;
        let service = render_service(lf, image, &self.config, &self.resource)?;
        let api = self.api(&ns);

        match api.create(&PostParams::default(), &service).await {
            Ok(created) => {
                info!(namespace = %ns, service = %created.name_any(), %image, "created service");
                Ok(created)
            }
            Err(e) => {
                let err = Error::from(e);
                if !err.is_already_exists() {
                    return Err(err);
                }
                api.get_opt(&lf.name_any())
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        kind: "Service",
                        name: lf.name_any(),
                    })
            }
        }
    }

    async fn update_service(
        &self,
        lf: &LambdaFunction,
        service: &DynamicObject,
        image: &str,
    ) -> Result<DynamicObject, Error> {
        let ns = namespace_of(lf)?;
        let mut desired = render_service(lf, image, &self.config, &self.resource)?;
        desired.metadata.resource_version = service.resource_version();
        let replaced = self
            .api(&ns)
            .replace(&lf.name_any(), &PostParams::default(), &desired)
            .await?;
        info!(namespace = %ns, service = %lf.name_any(), generation = lf.generation(), "updated service");
        Ok(replaced)
    }

    async fn update_service_image(
        &self,
        service: &DynamicObject,
        image: &str,
    ) -> Result<DynamicObject, Error> {
        let ns = service
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let updated = with_image(service, image)?;
        let replaced = self
            .api(&ns)
            .replace(&service.name_any(), &PostParams::default(), &updated)
            .await?;
        info!(namespace = %ns, service = %service.name_any(), %image, "updated service image");
        Ok(replaced)
    }

    /// Adds the replica count of the latest ready revision; a revision that
    /// cannot be read leaves it unknown.
    async fn get_service_status(&self, service: &DynamicObject) -> ServiceHealth {
        let mut health = service_health(service);
        let (Some(ns), Some(revision)) = (service.namespace(), health.latest_revision.clone()) else {
            return health;
        };
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &ns, &revision_resource());
        match api.get_opt(&revision).await {
            Ok(Some(rev)) => health.replicas = revision_replicas(&rev),
            Ok(None) => {}
            Err(e) => debug!(namespace = %ns, %revision, error = %e, "reading revision failed"),
        }
        health
    }

    async fn delete_service(&self, lf: &LambdaFunction) -> Result<(), Error> {
        let ns = namespace_of(lf)?;
        match self.api(&ns).delete(&lf.name_any(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }
}

pub fn service_image(service: &DynamicObject) -> Option<&str> {
    service.data.pointer(IMAGE_POINTER).and_then(Value::as_str)
}

pub fn service_generation(service: &DynamicObject) -> Option<i64> {
    service
        .annotations()
        .get(GENERATION_ANNOTATION)
        .and_then(|g| g.parse().ok())
}

pub fn with_image(service: &DynamicObject, image: &str) -> Result<DynamicObject, Error> {
    let mut updated = service.clone();
    let slot = updated
        .data
        .pointer_mut(IMAGE_POINTER)
        .ok_or(Error::MissingObjectKey(".spec.template.spec.containers[0].image"))?;
    *slot = Value::String(image.to_string());
    Ok(updated)
}

/// Ready when the `Ready` condition is True. Replicas come from the revision.
pub fn service_health(service: &DynamicObject) -> ServiceHealth {
    let status = service.data.get("status");
    let ready = status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Ready" && c["status"] == "True")
        });
    let field = |key: &str| {
        status
            .and_then(|s| s.get(key))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    ServiceHealth {
        ready,
        url: field("url"),
        replicas: None,
        latest_revision: field("latestReadyRevisionName"),
    }
}

pub fn revision_replicas(revision: &DynamicObject) -> Option<i32> {
    revision
        .data
        .pointer("/status/actualReplicas")
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
}

fn service_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), name.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        (NAME_LABEL.to_string(), name.to_string()),
    ])
}

fn env_entries(env: &[EnvVar]) -> Vec<Value> {
    env.iter()
        .map(|e| match e.value_from.as_ref() {
            Some(from) => {
                let mut value_from = serde_json::Map::new();
                if let Some(r) = from.secret_key_ref.as_ref() {
                    value_from.insert("secretKeyRef".into(), json!({ "name": r.name, "key": r.key }));
                }
                if let Some(r) = from.config_map_key_ref.as_ref() {
                    value_from.insert("configMapKeyRef".into(), json!({ "name": r.name, "key": r.key }));
                }
                json!({ "name": e.name, "valueFrom": value_from })
            }
            None => json!({ "name": e.name, "value": e.value.clone().unwrap_or_default() }),
        })
        .collect()
}

pub fn render_service(
    lf: &LambdaFunction,
    image: &str,
    cfg: &DeployConfig,
    resource: &ApiResource,
) -> Result<DynamicObject, Error> {
    let name = lf.name_any();
    let ns = namespace_of(lf)?;
    let owner = lf
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let strategy = lf.strategy();
    let image_source = match lf.spec.source.resolve() {
        Ok(Source::Image(image)) => Some(image),
        _ => None,
    };

    let scaling = lf.spec.scaling.clone().unwrap_or_default();
    let mut annotations = BTreeMap::from([
        ("autoscaling.knative.dev/class".to_string(), "kpa.autoscaling.knative.dev".to_string()),
        ("autoscaling.knative.dev/metric".to_string(), "concurrency".to_string()),
        (
            "autoscaling.knative.dev/min-scale".to_string(),
            scaling.min_replicas.unwrap_or(cfg.min_scale).to_string(),
        ),
        (
            "autoscaling.knative.dev/max-scale".to_string(),
            scaling.max_replicas.unwrap_or(cfg.max_scale).to_string(),
        ),
        (
            "autoscaling.knative.dev/target".to_string(),
            scaling.target_concurrency.unwrap_or(cfg.target_concurrency).to_string(),
        ),
    ]);
    if let Some(grace) = scaling.scale_to_zero_grace_period.as_ref() {
        annotations.insert(
            "autoscaling.knative.dev/scale-to-zero-pod-retention-period".into(),
            grace.clone(),
        );
    }

    let resources = lf.spec.resources.clone().unwrap_or_default();
    let requests = resources.requests.unwrap_or_default();
    let limits = resources.limits.unwrap_or_default();

    let mut env = Vec::new();
    match strategy {
        DeploymentStrategy::Build => {
            env.push(json!({ "name": "HANDLER", "value": lf.spec.runtime.handler() }));
        }
        DeploymentStrategy::Receiver => {
            env.push(json!({ "name": "FUNCTION_NAME", "value": name }));
            env.push(json!({ "name": "FUNCTION_NAMESPACE", "value": ns }));
        }
        DeploymentStrategy::PrebuiltImage => {}
    }
    env.extend(env_entries(&lf.spec.env));

    let port = image_source.and_then(|i| i.port).unwrap_or(cfg.port);
    let pull_policy = lf.spec.image_pull_policy.clone().unwrap_or_else(|| {
        match strategy {
            DeploymentStrategy::Build => "Always",
            DeploymentStrategy::PrebuiltImage | DeploymentStrategy::Receiver => "IfNotPresent",
        }
        .to_string()
    });

    let mut container = json!({
        "image": image,
        "imagePullPolicy": pull_policy,
        "ports": [{ "containerPort": port }],
        "env": env,
        "resources": {
            "requests": {
                "cpu": requests.cpu.unwrap_or_else(|| cfg.request_cpu.clone()),
                "memory": requests.memory.unwrap_or_else(|| cfg.request_memory.clone()),
            },
            "limits": {
                "cpu": limits.cpu.unwrap_or_else(|| cfg.limit_cpu.clone()),
                "memory": limits.memory.unwrap_or_else(|| cfg.limit_memory.clone()),
            },
        },
        "securityContext": {
            "allowPrivilegeEscalation": false,
            "capabilities": { "drop": ["ALL"] },
        },
    });

    let mut pod = json!({ "containers": [] });
    match strategy {
        DeploymentStrategy::Build => {
            container["readinessProbe"] = json!({ "httpGet": { "path": "/health" } });
            container["securityContext"]["runAsNonRoot"] = json!(true);
            container["securityContext"]["runAsUser"] = json!(RUNTIME_USER);
            container["securityContext"]["runAsGroup"] = json!(RUNTIME_USER);
            pod["serviceAccountName"] = json!(cfg.function_service_account);
            pod["automountServiceAccountToken"] = json!(false);
        }
        DeploymentStrategy::PrebuiltImage => {
            if let Some(image) = image_source {
                if !image.command.is_empty() {
                    container["command"] = json!(image.command);
                }
                if !image.args.is_empty() {
                    container["args"] = json!(image.args);
                }
                if !image.image_pull_secrets.is_empty() {
                    pod["imagePullSecrets"] = image
                        .image_pull_secrets
                        .iter()
                        .map(|s| json!({ "name": s }))
                        .collect();
                }
            }
            pod["serviceAccountName"] = json!(cfg.function_service_account);
            pod["automountServiceAccountToken"] = json!(false);
        }
        DeploymentStrategy::Receiver => {
            container["args"] = json!(["--mode=receiver"]);
            container["readinessProbe"] = json!({ "httpGet": { "path": "/ready" } });
            container["livenessProbe"] = json!({ "httpGet": { "path": "/health" } });
            pod["serviceAccountName"] = json!(cfg.receiver_service_account);
        }
    }
    if let Some(concurrency) = scaling.container_concurrency {
        pod["containerConcurrency"] = json!(concurrency);
    }
    pod["containers"] = json!([container]);

    let labels = service_labels(&name);
    let mut service = DynamicObject::new(&name, resource).within(&ns).data(json!({
        "spec": {
            "template": {
                "metadata": { "labels": labels, "annotations": annotations },
                "spec": pod,
            },
        },
    }));
    service.metadata.labels = Some(labels);
    service.metadata.annotations = Some(BTreeMap::from([(
        GENERATION_ANNOTATION.to_string(),
        lf.generation().to_string(),
    )]));
    service.metadata.owner_references = Some(vec![owner]);
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(spec: Value, annotations: Value) -> LambdaFunction {
        serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": {
                "name": "hello",
                "namespace": "team-a",
                "uid": "1234",
                "generation": 1,
                "annotations": annotations,
            },
            "spec": spec,
        }))
        .unwrap()
    }

    fn inline() -> LambdaFunction {
        function(
            json!({
                "source": { "type": "inline", "inline": { "code": "def handler(e): return e" } },
                "runtime": { "language": "python", "version": "3.12", "handler": "main.handler" },
                "scaling": { "minReplicas": 1, "containerConcurrency": 4 },
                "resources": { "limits": { "memory": "256Mi" } },
                "env": [
                    { "name": "LOG_LEVEL", "value": "debug" },
                    { "name": "API_KEY", "valueFrom": { "secretKeyRef": { "name": "creds", "key": "api" } } }
                ]
            }),
            json!({}),
        )
    }

    fn render(lf: &LambdaFunction, image: &str) -> DynamicObject {
        render_service(lf, image, &DeployConfig::default(), &service_resource()).unwrap()
    }

    #[test]
    fn built_function_service_shape() {
        let svc = render(&inline(), "localhost:5001/team-a/hello:abc");

        assert_eq!(svc.name_any(), "hello");
        assert_eq!(svc.namespace().as_deref(), Some("team-a"));
        assert_eq!(svc.owner_references()[0].uid, "1234");
        assert_eq!(svc.labels().get(NAME_LABEL).map(String::as_str), Some("hello"));
        assert_eq!(service_image(&svc), Some("localhost:5001/team-a/hello:abc"));
        assert_eq!(service_generation(&svc), Some(1));

        let template = &svc.data["spec"]["template"];
        let annotations = &template["metadata"]["annotations"];
        assert_eq!(annotations["autoscaling.knative.dev/min-scale"], "1");
        assert_eq!(annotations["autoscaling.knative.dev/max-scale"], "50");
        assert_eq!(annotations["autoscaling.knative.dev/target"], "10");

        let pod = &template["spec"];
        assert_eq!(pod["containerConcurrency"], 4);
        assert_eq!(pod["automountServiceAccountToken"], false);
        assert_eq!(pod["serviceAccountName"], "knative-lambda-function");

        let container = &pod["containers"][0];
        assert_eq!(container["imagePullPolicy"], "Always");
        assert_eq!(container["ports"][0]["containerPort"], 8080);
        assert_eq!(container["readinessProbe"]["httpGet"]["path"], "/health");
        assert_eq!(container["resources"]["limits"]["memory"], "256Mi");
        assert_eq!(container["resources"]["requests"]["cpu"], "50m");

        let env: Vec<&str> = container["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(env, ["HANDLER", "LOG_LEVEL", "API_KEY"]);
        assert_eq!(container["env"][2]["valueFrom"]["secretKeyRef"]["key"], "api");
    }

    #[test]
    fn node_function_image_user_matches_service_security_context() {
        let lf = function(
            json!({
                "source": { "type": "inline", "inline": { "code": "exports.handler = async (e) => e;" } },
                "runtime": { "language": "nodejs", "version": "20", "handler": "index.handler" }
            }),
            json!({}),
        );
        let language = crate::crd::Language::parse(&lf.spec.runtime.language).unwrap();
        let source = lf.spec.source.resolve().unwrap();
        let files = crate::templates::render_context(&lf.spec, source, language);
        assert!(files[0].content.contains("USER 65532:65532\n"));

        let svc = render(&lf, "localhost:5001/team-a/hello:abc");
        let sc = &svc.data["spec"]["template"]["spec"]["containers"][0]["securityContext"];
        assert_eq!(sc["runAsNonRoot"], true);
        assert_eq!(sc["runAsUser"], 65532);
        assert_eq!(sc["runAsGroup"], 65532);
        assert_eq!(sc["allowPrivilegeEscalation"], false);
    }

    #[test]
    fn prebuilt_image_service_uses_image_settings() {
        let lf = function(
            json!({
                "source": { "type": "image", "image": {
                    "repository": "ghcr.io/acme/fn", "port": 9090,
                    "args": ["--serve"], "imagePullSecrets": ["ghcr"]
                } },
                "runtime": { "language": "python", "version": "3.12" }
            }),
            json!({}),
        );
        let svc = render(&lf, "ghcr.io/acme/fn:latest");
        let pod = &svc.data["spec"]["template"]["spec"];
        let container = &pod["containers"][0];

        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["ports"][0]["containerPort"], 9090);
        assert_eq!(container["args"][0], "--serve");
        assert!(container.get("readinessProbe").is_none());
        assert_eq!(pod["imagePullSecrets"][0]["name"], "ghcr");
        assert!(container["env"].as_array().unwrap().is_empty());
    }

    #[test]
    fn receiver_service_runs_operator_image_in_receiver_mode() {
        let lf = function(
            json!({
                "source": { "type": "inline", "inline": { "code": "x" } },
                "runtime": { "language": "python", "version": "3.12" }
            }),
            json!({ "lambda.knative.io/use-operator-image": "true" }),
        );
        let svc = render(&lf, "localhost:5001/knative-lambda-operator:1.0.0");
        let pod = &svc.data["spec"]["template"]["spec"];

        assert_eq!(pod["serviceAccountName"], "knative-lambda-receiver");
        assert_eq!(pod["containers"][0]["args"][0], "--mode=receiver");
        assert_eq!(pod["containers"][0]["readinessProbe"]["httpGet"]["path"], "/ready");
    }

    #[test]
    fn health_follows_ready_condition() {
        let mut svc = render(&inline(), "img:1");
        assert_eq!(service_health(&svc), ServiceHealth::default());

        svc.data["status"] = json!({
            "url": "http://hello.team-a.example.com",
            "latestReadyRevisionName": "hello-00001",
            "conditions": [{ "type": "Ready", "status": "True" }]
        });
        let health = service_health(&svc);
        assert!(health.ready);
        assert_eq!(health.replicas, None);
        assert_eq!(health.url.as_deref(), Some("http://hello.team-a.example.com"));
        assert_eq!(health.latest_revision.as_deref(), Some("hello-00001"));
    }

    #[test]
    fn replicas_are_read_from_revision_status() {
        let revision = |status: Value| {
            DynamicObject::new("hello-00001", &revision_resource())
                .within("team-a")
                .data(json!({ "status": status }))
        };
        assert_eq!(revision_replicas(&revision(json!({ "actualReplicas": 3 }))), Some(3));
        assert_eq!(revision_replicas(&revision(json!({ "actualReplicas": 0 }))), Some(0));
        assert_eq!(revision_replicas(&revision(json!({}))), None);
        assert_eq!(revision_resource().plural, "revisions");
    }

    #[test]
    fn with_image_replaces_first_container_image() {
        let svc = render(&inline(), "img:1");
        let updated = with_image(&svc, "img:2").unwrap();
        assert_eq!(service_image(&updated), Some("img:2"));
        assert_eq!(service_image(&svc), Some("img:1"));
    }
}
