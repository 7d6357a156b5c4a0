use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::crd::{LambdaFunction, Language, MANAGED_BY, NAME_LABEL, Source};
use crate::error::Error;
use crate::templates::{self, ContextFile, SOURCE_DIR};

pub const BUILD_LABEL: &str = "lambda.knative.io/build";
pub const IMAGE_ANNOTATION: &str = "lambda.knative.io/image-uri";
pub const CONTENT_HASH_ANNOTATION: &str = "lambda.knative.io/content-hash";
pub const FIELD_MANAGER: &str = "lambda-operator";

const WORKSPACE: &str = "/workspace";
const CONTEXT_MOUNT: &str = "/context";
const CREDENTIALS_MOUNT: &str = "/var/secrets/source";
const NON_ROOT_UID: i64 = 65532;
/// The user the rootless BuildKit image is built for.
const BUILDKIT_UID: i64 = 1000;
const BUILDKIT_STATE: &str = "/home/user/.local/share/buildkit";
const MAX_NAME_LEN: usize = 63;

/// Staged inputs for one build: where the context lives and which image it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildContext {
    pub namespace: String,
    pub config_map: String,
    pub content_hash: String,
    /// Destination the build task pushes to.
    pub image_uri: String,
    /// Same image as seen from the nodes that will run it.
    pub pull_image_uri: String,
    /// ConfigMap key to context path.
    pub items: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuildProgress {
    pub completed: bool,
    pub success: bool,
    pub image_uri: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait BuildCoordinator: Send + Sync {
    /// Stages generated files for the build and resolves the target image.
    async fn create_build_context(&self, lf: &LambdaFunction) -> Result<BuildContext, Error>;

    /// Launches the build task; returns its name. Creating a task that
    /// already exists for this generation adopts it.
    async fn create_build_task(
        &self,
        lf: &LambdaFunction,
        context: &BuildContext,
    ) -> Result<String, Error>;

    /// Non-blocking poll. A missing task is a not-found error.
    async fn get_build_status(&self, namespace: &str, task: &str) -> Result<BuildProgress, Error>;

    /// Idempotent; a task that is already gone is not an error.
    async fn delete_build_task(&self, namespace: &str, task: &str) -> Result<(), Error>;
}

/// Builds images with rootless BuildKit in one Job per generation.
pub struct BuildKitBuilder {
    client: Client,
    config: BuildConfig,
}

impl BuildKitBuilder {
    pub fn new(client: Client, config: BuildConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl BuildCoordinator for BuildKitBuilder {
    async fn create_build_context(&self, lf: &LambdaFunction) -> Result<BuildContext, Error> {
        let (context, files) = plan_context(lf, &self.config)?;
        let cm = context_config_map(lf, &context, &files)?;

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &context.namespace);
        api.patch(
            &context.config_map,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&cm),
        )
        .await?;

        debug!(
            namespace = %context.namespace,
            config_map = %context.config_map,
            image = %context.image_uri,
            "staged build context"
        );
        Ok(context)
    }

    async fn create_build_task(
        &self,
        lf: &LambdaFunction,
        context: &BuildContext,
    ) -> Result<String, Error> {
        let job = build_job(lf, context, &self.config)?;
        let name = job.name_any();

        let api: Api<Job> = Api::namespaced(self.client.clone(), &context.namespace);
        match api.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(namespace = %context.namespace, task = %name, "created build task");
                Ok(name)
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    info!(namespace = %context.namespace, task = %name, "adopting existing build task");
                    Ok(name)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn get_build_status(&self, namespace: &str, task: &str) -> Result<BuildProgress, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(task).await? {
            Some(job) => Ok(job_progress(&job)),
            None => Err(Error::NotFound {
                kind: "Job",
                name: task.to_string(),
            }),
        }
    }

    async fn delete_build_task(&self, namespace: &str, task: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(task, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }
}

/// `{name}-build-{generation}`, shortened to stay a valid label value.
pub fn task_name(name: &str, generation: i64) -> String {
    let suffix = format!("-build-{generation}");
    let keep = MAX_NAME_LEN.saturating_sub(suffix.len());
    let base: String = name.chars().take(keep).collect();
    format!("{}{suffix}", base.trim_end_matches('-'))
}

pub fn context_name(name: &str) -> String {
    format!("{name}-build-context")
}

pub fn content_hash(files: &[ContextFile], descriptor: &str, generation: i64) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.content.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(descriptor.as_bytes());
    hasher.update(generation.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Renders the context files and derives the image reference from their hash.
pub fn plan_context(
    lf: &LambdaFunction,
    cfg: &BuildConfig,
) -> Result<(BuildContext, Vec<ContextFile>), Error> {
    let namespace = lf
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = lf.name_any();
    let source = lf.spec.source.resolve()?;
    let language = Language::parse(&lf.spec.runtime.language).ok_or_else(|| {
        Error::BuildContext(format!("unsupported runtime language: {}", lf.spec.runtime.language))
    })?;
    if let Source::Image(_) = source {
        return Err(Error::BuildContext("image sources are deployed without a build".into()));
    }

    let files = templates::render_context(&lf.spec, source, language);
    let descriptor = serde_json::to_string(&lf.spec.source)?;
    let hash = content_hash(&files, &descriptor, lf.generation());

    let build = lf.spec.build.as_ref();
    let push_registry = cfg.push_registry.trim_end_matches('/');
    let registry = build
        .and_then(|b| b.registry.as_deref())
        .map(|r| r.trim_end_matches('/'))
        .unwrap_or(push_registry);
    let repository = build
        .and_then(|b| b.repository.clone())
        .unwrap_or_else(|| format!("{namespace}/{name}"));
    let tag = &hash[..12];

    let image_uri = format!("{registry}/{repository}:{tag}");
    let pull_image_uri = if registry == push_registry {
        format!("{}/{repository}:{tag}", cfg.pull_registry().trim_end_matches('/'))
    } else {
        image_uri.clone()
    };

    let context = BuildContext {
        namespace,
        config_map: context_name(&name),
        content_hash: hash,
        image_uri,
        pull_image_uri,
        items: files.iter().map(|f| (f.key.clone(), f.path.clone())).collect(),
    };
    Ok((context, files))
}

fn build_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), name.to_string()),
        (BUILD_LABEL.to_string(), "true".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
    ])
}

pub fn context_config_map(
    lf: &LambdaFunction,
    context: &BuildContext,
    files: &[ContextFile],
) -> Result<ConfigMap, Error> {
    let owner = lf
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(context.config_map.clone()),
            namespace: Some(context.namespace.clone()),
            labels: Some(build_labels(&lf.name_any())),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(
            files
                .iter()
                .map(|f| (f.key.clone(), f.content.clone()))
                .collect(),
        ),
        ..Default::default()
    })
}

pub fn build_job(lf: &LambdaFunction, context: &BuildContext, cfg: &BuildConfig) -> Result<Job, Error> {
    let name = lf.name_any();
    let owner = lf
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let source = lf.spec.source.resolve()?;
    let language = Language::parse(&lf.spec.runtime.language).ok_or_else(|| {
        Error::BuildContext(format!("unsupported runtime language: {}", lf.spec.runtime.language))
    })?;
    let build = lf.spec.build.as_ref();
    let timeout = build
        .and_then(|b| b.timeout_seconds)
        .unwrap_or(cfg.timeout_seconds);
    let cache = build.and_then(|b| b.cache).unwrap_or(cfg.cache);

    let items: Vec<Value> = context
        .items
        .iter()
        .map(|(key, path)| json!({ "key": key, "path": path }))
        .collect();

    let mut volumes = vec![
        json!({ "name": "context", "configMap": { "name": context.config_map, "items": items } }),
        json!({ "name": "workspace", "emptyDir": {} }),
    ];

    let mut init_containers = vec![json!({
        "name": "stage-context",
        "image": cfg.helper_image,
        "command": ["cp"],
        "args": ["-rL", format!("{CONTEXT_MOUNT}/."), format!("{WORKSPACE}/")],
        "volumeMounts": [
            { "name": "context", "mountPath": CONTEXT_MOUNT, "readOnly": true },
            { "name": "workspace", "mountPath": WORKSPACE },
        ],
        "securityContext": restricted_security_context(),
    })];

    let (fetch, fetch_volumes) = fetch_steps(source, language, lf.spec.runtime.handler(), cfg);
    init_containers.extend(fetch);
    volumes.extend(fetch_volumes);

    let args = buildctl_args(&context.image_uri, cache, cfg);
    volumes.push(json!({ "name": "buildkitd", "emptyDir": {} }));

    let labels = build_labels(&name);
    let task = task_name(&name, lf.generation());

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": task,
            "namespace": context.namespace,
            "labels": labels,
            "annotations": {
                IMAGE_ANNOTATION: context.pull_image_uri,
                CONTENT_HASH_ANNOTATION: context.content_hash,
            },
            "ownerReferences": [owner],
        },
        "spec": {
            "backoffLimit": 0,
            "ttlSecondsAfterFinished": cfg.ttl_seconds_after_finished,
            "activeDeadlineSeconds": timeout,
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "restartPolicy": "Never",
                    "automountServiceAccountToken": false,
                    "serviceAccountName": cfg.service_account,
                    "securityContext": { "seccompProfile": { "type": "RuntimeDefault" } },
                    "initContainers": init_containers,
                    "containers": [{
                        "name": "buildkit",
                        "image": cfg.builder_image,
                        "command": ["buildctl-daemonless.sh"],
                        "args": args,
                        "env": [{ "name": "BUILDKITD_FLAGS", "value": "--oci-worker-no-process-sandbox" }],
                        "volumeMounts": [
                            { "name": "workspace", "mountPath": WORKSPACE, "readOnly": true },
                            { "name": "buildkitd", "mountPath": BUILDKIT_STATE },
                        ],
                        "resources": {
                            "requests": { "cpu": "250m", "memory": "512Mi" },
                            "limits": { "cpu": "1", "memory": "2Gi" },
                        },
                        // User namespaces need unconfined seccomp and AppArmor profiles.
                        "securityContext": {
                            "privileged": false,
                            "allowPrivilegeEscalation": false,
                            "runAsNonRoot": true,
                            "runAsUser": BUILDKIT_UID,
                            "runAsGroup": BUILDKIT_UID,
                            "capabilities": { "drop": ["ALL"] },
                            "seccompProfile": { "type": "Unconfined" },
                            "appArmorProfile": { "type": "Unconfined" },
                        },
                    }],
                    "volumes": volumes,
                },
            },
        },
    });

    Ok(serde_json::from_value(job)?)
}

/// `buildctl build` arguments: Dockerfile frontend over the staged
/// workspace, pushing to `image`. The registry cache defaults to a
/// `buildcache` tag next to the image.
fn buildctl_args(image: &str, cache: bool, cfg: &BuildConfig) -> Vec<String> {
    let insecure = if cfg.insecure_registry { ",registry.insecure=true" } else { "" };
    let mut args = vec![
        "build".to_string(),
        "--frontend".into(),
        "dockerfile.v0".into(),
        "--local".into(),
        format!("context={WORKSPACE}"),
        "--local".into(),
        format!("dockerfile={WORKSPACE}"),
        "--output".into(),
        format!("type=image,name={image},push=true{insecure}"),
        "--metadata-file".into(),
        "/dev/termination-log".into(),
    ];
    if cache {
        let cache_ref = cfg.cache_repo.clone().unwrap_or_else(|| {
            let repo = image.rsplit_once(':').map_or(image, |(repo, _)| repo);
            format!("{repo}:buildcache")
        });
        args.extend([
            "--export-cache".to_string(),
            format!("type=registry,ref={cache_ref},mode=max{insecure}"),
            "--import-cache".into(),
            format!("type=registry,ref={cache_ref}{insecure}"),
        ]);
    }
    args
}

fn restricted_security_context() -> Value {
    json!({
        "allowPrivilegeEscalation": false,
        "runAsNonRoot": true,
        "runAsUser": NON_ROOT_UID,
        "runAsGroup": NON_ROOT_UID,
        "capabilities": { "drop": ["ALL"] },
    })
}

enum Archive {
    Zip,
    TarGz,
}

impl Archive {
    fn detect(key: &str) -> Option<Self> {
        if key.ends_with(".zip") {
            Some(Archive::Zip)
        } else if key.ends_with(".tar.gz") || key.ends_with(".tgz") {
            Some(Archive::TarGz)
        } else {
            None
        }
    }
}

/// Init containers that pull remote source into the workspace. Every step is
/// an argument list; nothing goes through a shell.
fn fetch_steps(
    source: Source<'_>,
    language: Language,
    handler: &str,
    cfg: &BuildConfig,
) -> (Vec<Value>, Vec<Value>) {
    let (key, object_url, fetcher, volumes) = match source {
        Source::Inline(_) | Source::Image(_) => return (vec![], vec![]),
        Source::Git(git) => {
            let steps = git_steps(&git.url, git.git_ref.as_deref(), git.secret_ref.as_deref(), cfg);
            return (steps, vec![]);
        }
        Source::Minio(minio) => {
            let endpoint = minio
                .endpoint
                .as_deref()
                .filter(|e| !e.is_empty())
                .unwrap_or(&cfg.minio_endpoint);
            let mut extra = vec!["--endpoint-url".to_string(), format!("http://{endpoint}")];
            if minio.secret_ref.is_none() {
                extra.push("--no-sign-request".into());
            }
            (
                minio.key.as_str(),
                format!("s3://{}/{}", minio.bucket, minio.key),
                Fetcher::Aws { extra, secret: minio.secret_ref.as_deref() },
                vec![],
            )
        }
        Source::S3(s3) => {
            let mut extra = vec![];
            if let Some(region) = s3.region.as_deref().filter(|r| !r.is_empty()) {
                extra.extend(["--region".to_string(), region.to_string()]);
            }
            (
                s3.key.as_str(),
                format!("s3://{}/{}", s3.bucket, s3.key),
                Fetcher::Aws { extra, secret: s3.secret_ref.as_deref() },
                vec![],
            )
        }
        Source::Gcs(gcs) => {
            let volumes = gcs
                .secret_ref
                .as_deref()
                .map(|secret| json!({ "name": "source-credentials", "secret": { "secretName": secret } }))
                .into_iter()
                .collect();
            (
                gcs.key.as_str(),
                format!("gs://{}/{}", gcs.bucket, gcs.key),
                Fetcher::Gcloud { project: gcs.project.as_deref(), secret: gcs.secret_ref.as_deref() },
                volumes,
            )
        }
    };

    let archive = Archive::detect(key);
    let destination = match archive {
        Some(Archive::Zip) => format!("{WORKSPACE}/source.zip"),
        Some(Archive::TarGz) => format!("{WORKSPACE}/source.tar.gz"),
        None => format!(
            "{WORKSPACE}/{SOURCE_DIR}/{}",
            templates::source_filename(language, handler)
        ),
    };

    let mut steps = vec![fetcher.container(&object_url, &destination, cfg)];
    let source_dir = format!("{WORKSPACE}/{SOURCE_DIR}");
    match archive {
        Some(Archive::Zip) => steps.push(helper_step(
            "extract-source",
            &cfg.helper_image,
            &["unzip", "-o", destination.as_str(), "-d", source_dir.as_str()],
        )),
        Some(Archive::TarGz) => steps.push(helper_step(
            "extract-source",
            &cfg.helper_image,
            &["tar", "-xzf", destination.as_str(), "-C", source_dir.as_str()],
        )),
        None => {}
    }

    (steps, volumes)
}

enum Fetcher<'a> {
    Aws { extra: Vec<String>, secret: Option<&'a str> },
    Gcloud { project: Option<&'a str>, secret: Option<&'a str> },
}

impl Fetcher<'_> {
    fn container(&self, object_url: &str, destination: &str, cfg: &BuildConfig) -> Value {
        let workspace_mount = json!([{ "name": "workspace", "mountPath": WORKSPACE }]);
        match self {
            Fetcher::Aws { extra, secret } => {
                let mut args = vec!["s3".to_string(), "cp".into(), object_url.into(), destination.into()];
                args.extend(extra.iter().cloned());
                let env_from: Vec<Value> = secret
                    .map(|s| json!({ "secretRef": { "name": s } }))
                    .into_iter()
                    .collect();
                json!({
                    "name": "fetch-source",
                    "image": cfg.aws_cli_image,
                    "command": ["aws"],
                    "args": args,
                    "env": [{ "name": "HOME", "value": "/tmp" }],
                    "envFrom": env_from,
                    "volumeMounts": workspace_mount,
                    "securityContext": restricted_security_context(),
                })
            }
            Fetcher::Gcloud { project, secret } => {
                let mut env = vec![
                    json!({ "name": "HOME", "value": "/tmp" }),
                    json!({ "name": "CLOUDSDK_CONFIG", "value": "/tmp/gcloud" }),
                ];
                if let Some(project) = project {
                    env.push(json!({ "name": "CLOUDSDK_CORE_PROJECT", "value": project }));
                }
                let mut mounts = vec![json!({ "name": "workspace", "mountPath": WORKSPACE })];
                if secret.is_some() {
                    env.push(json!({
                        "name": "CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE",
                        "value": format!("{CREDENTIALS_MOUNT}/key.json"),
                    }));
                    mounts.push(json!({ "name": "source-credentials", "mountPath": CREDENTIALS_MOUNT, "readOnly": true }));
                }
                json!({
                    "name": "fetch-source",
                    "image": cfg.gcloud_image,
                    "command": ["gcloud"],
                    "args": ["storage", "cp", object_url, destination],
                    "env": env,
                    "volumeMounts": mounts,
                    "securityContext": restricted_security_context(),
                })
            }
        }
    }
}

/// How a git ref is checked out.
#[derive(Debug, PartialEq, Eq)]
enum GitRef<'a> {
    /// Default branch.
    Head,
    /// Branch or tag, cloned directly.
    Named(&'a str),
    /// Full object id, fetched on its own.
    Commit(&'a str),
    /// Abbreviated object id; needs full history to resolve.
    ShortCommit(&'a str),
}

impl<'a> GitRef<'a> {
    fn classify(git_ref: Option<&'a str>) -> Self {
        let Some(r) = git_ref.filter(|r| !r.is_empty()) else {
            return GitRef::Head;
        };
        if !r.chars().all(|c| c.is_ascii_hexdigit()) {
            return GitRef::Named(r);
        }
        match r.len() {
            40 | 64 => GitRef::Commit(r),
            7..=39 => GitRef::ShortCommit(r),
            _ => GitRef::Named(r),
        }
    }
}

/// Init containers that check the repository out into the source dir.
/// Branches and tags use a shallow clone; commit ids are fetched and
/// checked out since `clone --branch` cannot take them.
fn git_steps(url: &str, git_ref: Option<&str>, secret: Option<&str>, cfg: &BuildConfig) -> Vec<Value> {
    let dir = format!("{WORKSPACE}/{SOURCE_DIR}");
    let dir = dir.as_str();
    let argv = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();

    let commands: Vec<(&str, Vec<String>)> = match GitRef::classify(git_ref) {
        GitRef::Head => vec![("fetch-source", argv(&["clone", "--depth", "1", "--", url, dir]))],
        GitRef::Named(name) => vec![(
            "fetch-source",
            argv(&["clone", "--depth", "1", "--branch", name, "--", url, dir]),
        )],
        GitRef::Commit(sha) => vec![
            ("init-source", argv(&["init", "--quiet", dir])),
            ("fetch-source", argv(&["-C", dir, "fetch", "--depth", "1", "--", url, sha])),
            ("checkout-source", argv(&["-C", dir, "checkout", "--detach", "FETCH_HEAD"])),
        ],
        GitRef::ShortCommit(sha) => vec![
            ("fetch-source", argv(&["clone", "--", url, dir])),
            ("checkout-source", argv(&["-C", dir, "checkout", sha, "--"])),
        ],
    };

    let env = git_env(secret);
    commands
        .into_iter()
        .map(|(name, args)| {
            json!({
                "name": name,
                "image": cfg.git_image,
                "command": ["git"],
                "args": args,
                "env": env,
                "volumeMounts": [{ "name": "workspace", "mountPath": WORKSPACE }],
                "securityContext": restricted_security_context(),
            })
        })
        .collect()
}

fn git_env(secret: Option<&str>) -> Vec<Value> {
    let mut env = vec![json!({ "name": "HOME", "value": "/tmp" })];
    if let Some(secret) = secret {
        // Kubernetes expands $(GIT_TOKEN) from the preceding entry.
        env.extend([
            json!({ "name": "GIT_TOKEN", "valueFrom": { "secretKeyRef": { "name": secret, "key": "token" } } }),
            json!({ "name": "GIT_CONFIG_COUNT", "value": "1" }),
            json!({ "name": "GIT_CONFIG_KEY_0", "value": "http.extraHeader" }),
            json!({ "name": "GIT_CONFIG_VALUE_0", "value": "Authorization: Bearer $(GIT_TOKEN)" }),
        ]);
    }
    env
}

fn helper_step(name: &str, image: &str, argv: &[&str]) -> Value {
    json!({
        "name": name,
        "image": image,
        "command": [argv[0]],
        "args": &argv[1..],
        "volumeMounts": [{ "name": "workspace", "mountPath": WORKSPACE }],
        "securityContext": restricted_security_context(),
    })
}

/// Reads the Job's terminal conditions; anything else is still running.
pub fn job_progress(job: &Job) -> BuildProgress {
    let image_uri = job.annotations().get(IMAGE_ANNOTATION).cloned();
    let status = job.status.as_ref();
    let condition = |kind: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == kind && c.status == "True"))
    };

    if condition("Complete").is_some() || status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        return BuildProgress {
            completed: true,
            success: true,
            image_uri,
            error: None,
        };
    }

    if let Some(failed) = condition("Failed") {
        let error = failed
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Build job failed".to_string());
        return BuildProgress {
            completed: true,
            success: false,
            image_uri,
            error: Some(error),
        };
    }

    BuildProgress {
        image_uri,
        ..Default::default()
    }
}
