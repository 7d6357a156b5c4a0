//! In-memory stand-ins for every collaborator of the reconciler. Each fake
//! writes to a shared [`Journal`] so tests can assert call order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde_json::{Value, json};

use crate::builder::{BuildContext, BuildCoordinator, BuildProgress, task_name};
use crate::config::{Config, DeployConfig};
use crate::context::Ctx;
use crate::crd::LambdaFunction;
use crate::deploy::{DeployCoordinator, render_service, service_resource, with_image};
use crate::error::Error;
use crate::event::{Notification, NotificationSink, Notifier, Outcome};
use crate::eventing::EventingCoordinator;
use crate::finalizer::{FINALIZER, with_finalizer, without_finalizer};
use crate::metrics::Metrics;
use crate::store::FunctionStore;

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

fn failure(what: &str) -> Error {
    Error::Config(format!("{what} failed"))
}

pub struct FakeStore {
    journal: Journal,
    pub object: Mutex<Option<LambdaFunction>>,
    /// Number of upcoming status writes to reject as stale.
    pub conflicts: AtomicUsize,
}

impl FakeStore {
    fn bump(lf: &mut LambdaFunction) {
        let next = lf
            .resource_version()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        lf.metadata.resource_version = Some(next.to_string());
    }
}

#[async_trait]
impl FunctionStore for FakeStore {
    async fn get(&self, _namespace: &str, _name: &str) -> Result<Option<LambdaFunction>, Error> {
        Ok(self.object.lock().unwrap().clone())
    }

    async fn update_status(&self, lf: &LambdaFunction) -> Result<LambdaFunction, Error> {
        self.journal.record(format!("store.status:{}", lf.phase()));
        let mut guard = self.object.lock().unwrap();
        let stored = guard.as_mut().ok_or_else(|| Error::NotFound {
            kind: "LambdaFunction",
            name: lf.name_any(),
        })?;
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || stored.resource_version() != lf.resource_version() {
            return Err(Error::Conflict(lf.name_any()));
        }
        stored.status = lf.status.clone();
        Self::bump(stored);
        Ok(stored.clone())
    }

    async fn add_finalizer(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
        self.journal.record("store.add_finalizer");
        let Some(finalizers) = with_finalizer(lf, FINALIZER) else {
            return Ok(Outcome::NoOp);
        };
        if let Some(stored) = self.object.lock().unwrap().as_mut() {
            stored.metadata.finalizers = Some(finalizers);
            Self::bump(stored);
        }
        Ok(Outcome::Created)
    }

    async fn remove_finalizer(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
        self.journal.record("store.remove_finalizer");
        let Some(finalizers) = without_finalizer(lf, FINALIZER) else {
            return Ok(Outcome::NoOp);
        };
        let mut guard = self.object.lock().unwrap();
        if guard.as_ref().is_some_and(|s| s.metadata.deletion_timestamp.is_some()) && finalizers.is_empty() {
            *guard = None;
        } else if let Some(stored) = guard.as_mut() {
            stored.metadata.finalizers = Some(finalizers);
            Self::bump(stored);
        }
        Ok(Outcome::Updated)
    }
}

#[derive(Default)]
pub struct FakeBuilder {
    journal: Journal,
    pub fail_context: AtomicBool,
    pub fail_task: AtomicBool,
    pub fail_delete: AtomicBool,
    /// `None` makes the task look deleted.
    pub progress: Mutex<Option<BuildProgress>>,
}

impl FakeBuilder {
    pub fn finish(&self, success: bool) {
        *self.progress.lock().unwrap() = Some(BuildProgress {
            completed: true,
            success,
            image_uri: success.then(|| "localhost:5001/team-a/hello:abc123".to_string()),
            error: (!success).then(|| "buildctl exited with code 1".to_string()),
        });
    }
}

#[async_trait]
impl BuildCoordinator for FakeBuilder {
    async fn create_build_context(&self, lf: &LambdaFunction) -> Result<BuildContext, Error> {
        self.journal.record("build.context");
        if self.fail_context.load(Ordering::SeqCst) {
            return Err(Error::BuildContext("object store unreachable".into()));
        }
        let image = "localhost:5001/team-a/hello:abc123".to_string();
        Ok(BuildContext {
            namespace: lf.namespace().unwrap_or_default(),
            config_map: format!("{}-build-context", lf.name_any()),
            content_hash: "abc123".into(),
            image_uri: image.clone(),
            pull_image_uri: image,
            items: Vec::new(),
        })
    }

    async fn create_build_task(&self, lf: &LambdaFunction, _context: &BuildContext) -> Result<String, Error> {
        self.journal.record("build.task");
        if self.fail_task.load(Ordering::SeqCst) {
            return Err(failure("job creation"));
        }
        *self.progress.lock().unwrap() = Some(BuildProgress::default());
        Ok(task_name(&lf.name_any(), lf.generation()))
    }

    async fn get_build_status(&self, _namespace: &str, task: &str) -> Result<BuildProgress, Error> {
        self.journal.record("build.status");
        self.progress
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NotFound {
                kind: "Job",
                name: task.to_string(),
            })
    }

    async fn delete_build_task(&self, _namespace: &str, task: &str) -> Result<(), Error> {
        self.journal.record(format!("build.delete:{task}"));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(failure("job deletion"));
        }
        *self.progress.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDeployer {
    journal: Journal,
    pub service: Mutex<Option<DynamicObject>>,
    pub ready: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FakeDeployer {
    fn ready_status() -> Value {
        json!({
            "url": "http://hello.team-a.example.com",
            "latestReadyRevisionName": "hello-00001",
            "conditions": [{ "type": "Ready", "status": "True" }]
        })
    }

    fn store(&self, service: DynamicObject) -> DynamicObject {
        *self.service.lock().unwrap() = Some(service.clone());
        service
    }
}

#[async_trait]
impl DeployCoordinator for FakeDeployer {
    async fn get_service(&self, _lf: &LambdaFunction) -> Result<Option<DynamicObject>, Error> {
        self.journal.record("deploy.get");
        let mut service = self.service.lock().unwrap().clone();
        if let Some(svc) = service.as_mut() {
            if self.ready.load(Ordering::SeqCst) {
                svc.data["status"] = Self::ready_status();
            }
        }
        Ok(service)
    }

    async fn create_service(&self, lf: &LambdaFunction, image: &str) -> Result<DynamicObject, Error> {
        self.journal.record(format!("deploy.create:{image}"));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(failure("service creation"));
        }
        let service = render_service(lf, image, &DeployConfig::default(), &service_resource())?;
        Ok(self.store(service))
    }

    async fn update_service(
        &self,
        lf: &LambdaFunction,
        _service: &DynamicObject,
        image: &str,
    ) -> Result<DynamicObject, Error> {
        self.journal.record(format!("deploy.update:{image}"));
        let service = render_service(lf, image, &DeployConfig::default(), &service_resource())?;
        Ok(self.store(service))
    }

    async fn update_service_image(&self, service: &DynamicObject, image: &str) -> Result<DynamicObject, Error> {
        self.journal.record(format!("deploy.update_image:{image}"));
        let updated = with_image(service, image)?;
        Ok(self.store(updated))
    }

    async fn delete_service(&self, _lf: &LambdaFunction) -> Result<(), Error> {
        self.journal.record("deploy.delete");
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(failure("service deletion"));
        }
        *self.service.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeEventing {
    journal: Journal,
    pub fail_reconcile: AtomicBool,
    pub fail_delete: AtomicBool,
}

#[async_trait]
impl EventingCoordinator for FakeEventing {
    async fn reconcile_eventing(&self, _lf: &LambdaFunction) -> Result<Outcome, Error> {
        self.journal.record("eventing.reconcile");
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(failure("trigger creation"));
        }
        Ok(Outcome::NoOp)
    }

    async fn delete_eventing(&self, _lf: &LambdaFunction) -> Result<(), Error> {
        self.journal.record("eventing.delete");
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(failure("trigger deletion"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink(Mutex<Vec<String>>);

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, _subject: &ObjectReference, notification: &Notification) -> Result<(), Error> {
        self.0.lock().unwrap().push(notification.kind().to_string());
        Ok(())
    }
}

/// A function named `hello` in `team-a` at generation 1 that already carries the finalizer.
pub fn function(spec: Value) -> LambdaFunction {
    serde_json::from_value(json!({
        "apiVersion": "lambda.knative.io/v1alpha1",
        "kind": "LambdaFunction",
        "metadata": {
            "name": "hello",
            "namespace": "team-a",
            "uid": "5f1c0de2",
            "generation": 1,
            "resourceVersion": "1",
            "finalizers": [FINALIZER],
        },
        "spec": spec,
    }))
    .unwrap()
}

pub fn inline_spec() -> Value {
    json!({
        "source": { "type": "inline", "inline": { "code": "def handler(event):\n    return event\n" } },
        "runtime": { "language": "python", "version": "3.12", "handler": "main.handler" }
    })
}

pub struct Harness {
    pub ctx: Arc<Ctx>,
    pub journal: Journal,
    pub store: Arc<FakeStore>,
    pub builder: Arc<FakeBuilder>,
    pub deployer: Arc<FakeDeployer>,
    pub eventing: Arc<FakeEventing>,
    pub sink: Arc<RecordingSink>,
    pub metrics: Metrics,
}

impl Harness {
    pub fn new(lf: LambdaFunction) -> Self {
        let config = Config {
            operator_version: Some("1.0.0".into()),
            ..Config::default()
        };
        Self::with_config(lf, config)
    }

    pub fn with_config(lf: LambdaFunction, config: Config) -> Self {
        let journal = Journal::default();
        let metrics = Metrics::new().unwrap();
        let store = Arc::new(FakeStore {
            journal: journal.clone(),
            object: Mutex::new(Some(lf)),
            conflicts: AtomicUsize::new(0),
        });
        let builder = Arc::new(FakeBuilder {
            journal: journal.clone(),
            ..Default::default()
        });
        let deployer = Arc::new(FakeDeployer {
            journal: journal.clone(),
            ..Default::default()
        });
        let eventing = Arc::new(FakeEventing {
            journal: journal.clone(),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(
            vec![sink.clone() as Arc<dyn NotificationSink>],
            metrics.clone(),
            Duration::from_secs(1),
        );

        let ctx = Arc::new(Ctx {
            store: store.clone(),
            builder: builder.clone(),
            deployer: deployer.clone(),
            eventing: eventing.clone(),
            notifier,
            metrics: metrics.clone(),
            config: Arc::new(config),
        });

        Self {
            ctx,
            journal,
            store,
            builder,
            deployer,
            eventing,
            sink,
            metrics,
        }
    }

    /// Current stored object.
    pub fn stored(&self) -> LambdaFunction {
        self.store.object.lock().unwrap().clone().unwrap()
    }

    pub fn exists(&self) -> bool {
        self.store.object.lock().unwrap().is_some()
    }

    /// Mutates the stored object the way a user edit or the API server would.
    pub fn edit(&self, f: impl FnOnce(&mut LambdaFunction)) {
        let mut guard = self.store.object.lock().unwrap();
        if let Some(lf) = guard.as_mut() {
            f(lf);
            FakeStore::bump(lf);
        }
    }

    /// Notifications delivered so far. Lets detached deliveries run first.
    pub async fn notifications(&self) -> Vec<String> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        self.sink.0.lock().unwrap().clone()
    }
}
