use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::api::DynamicObject;
use kube_runtime::controller::Action;
use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::context::Ctx;
use crate::crd::{
    BuildStatus, ConditionType, DeploymentStrategy, LambdaFunction, Language, Phase, ServiceStatus,
    Source, SourceError, timestamp,
};
use crate::deploy::{ServiceHealth, service_generation, service_image};
use crate::error::Error;
use crate::event::Notification;
use crate::finalizer::{FINALIZER, has_finalizer, is_deleting};
use crate::metrics::ReconcileResult;
use crate::validation;

/// When the function should be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Immediate,
    /// Actively progressing phases.
    Short,
    /// Steady-state monitoring.
    Medium,
    /// Known-bad or blocked functions.
    Long,
    AwaitChange,
}

impl Requeue {
    pub fn into_action(self, cfg: &ControllerConfig) -> Action {
        match self {
            Requeue::Immediate => Action::requeue(Duration::ZERO),
            Requeue::Short => Action::requeue(cfg.short()),
            Requeue::Medium => Action::requeue(cfg.medium()),
            Requeue::Long => Action::requeue(cfg.long()),
            Requeue::AwaitChange => Action::await_change(),
        }
    }

    fn result(self) -> ReconcileResult {
        match self {
            Requeue::Immediate | Requeue::Short => ReconcileResult::Requeue,
            Requeue::Medium | Requeue::Long | Requeue::AwaitChange => ReconcileResult::Success,
        }
    }
}

pub async fn reconcile(lf: Arc<LambdaFunction>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let started = Instant::now();
    let phase = lf.phase();
    let namespace = lf
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let (result, requeue) = match reconcile_function(&namespace, &lf.name_any(), &ctx).await {
        Ok(requeue) => (requeue.result(), requeue),
        Err(e) if e.is_conflict() => {
            debug!(%namespace, name = %lf.name_any(), "status write lost a race, retrying");
            (ReconcileResult::Conflict, Requeue::Immediate)
        }
        Err(e) => {
            ctx.metrics
                .record_reconcile(phase, ReconcileResult::Error, started.elapsed());
            return Err(e);
        }
    };

    ctx.metrics.record_reconcile(phase, result, started.elapsed());
    Ok(requeue.into_action(&ctx.config.controller))
}

pub fn error_policy(lf: Arc<LambdaFunction>, error: &Error, ctx: Arc<Ctx>) -> Action {
    warn!(
        namespace = ?lf.namespace(),
        name = %lf.name_any(),
        phase = %lf.phase(),
        error = %error,
        "reconcile failed"
    );
    ctx.metrics.record_error("reconciler", error.metric_label());
    Action::requeue(ctx.config.controller.short())
}

/// One pass of the state machine against a fresh read of the function.
#[instrument(skip_all, fields(namespace = %namespace, name = %name))]
pub async fn reconcile_function(namespace: &str, name: &str, ctx: &Ctx) -> Result<Requeue, Error> {
    let Some(mut lf) = ctx.store.get(namespace, name).await? else {
        debug!("function is gone");
        return Ok(Requeue::AwaitChange);
    };
    let before = lf.phase();

    let requeue = if is_deleting(&lf) {
        delete(&mut lf, ctx).await?
    } else if !has_finalizer(&lf, FINALIZER) {
        ctx.store.add_finalizer(&lf).await?;
        debug!("added finalizer");
        Requeue::Immediate
    } else {
        match before {
            Phase::Pending => pending(&mut lf, ctx).await?,
            Phase::Building => building(&mut lf, ctx).await?,
            Phase::Deploying => deploying(&mut lf, ctx).await?,
            Phase::Ready => ready(&mut lf, ctx).await?,
            Phase::Failed => failed(&mut lf, ctx).await?,
            Phase::Deleting | Phase::Unknown => {
                reset_to_pending(&mut lf, ctx, "status phase is not valid for a live function").await?
            }
        }
    };

    let after = lf.phase();
    if after != before {
        info!(from = %before, to = %after, "phase changed");
        ctx.metrics.record_transition(before, after);
    }
    Ok(requeue)
}

async fn persist(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<(), Error> {
    let stored = ctx.store.update_status(lf).await?;
    lf.metadata.resource_version = stored.metadata.resource_version;
    Ok(())
}

async fn reset_to_pending(lf: &mut LambdaFunction, ctx: &Ctx, why: &str) -> Result<Requeue, Error> {
    info!(reason = why, "resetting to Pending");
    lf.status_mut().phase = Phase::Pending;
    persist(lf, ctx).await?;
    Ok(Requeue::Immediate)
}

fn build_status(lf: &LambdaFunction) -> Option<&BuildStatus> {
    lf.status.as_ref().and_then(|s| s.build_status.as_ref())
}

fn runtime_label(lf: &LambdaFunction) -> &'static str {
    Language::parse(&lf.spec.runtime.language)
        .map(|l| l.as_str())
        .unwrap_or("unknown")
}

/// Attempts are counted per generation.
fn next_attempt(lf: &LambdaFunction) -> i32 {
    match build_status(lf) {
        Some(b) if lf.observed_generation() == Some(lf.generation()) => b.attempt + 1,
        _ => 1,
    }
}

async fn sync_eventing(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<(), Error> {
    if !lf.eventing_enabled() {
        lf.status_mut().set_condition(
            ConditionType::EventingReady,
            true,
            "EventingDisabled",
            "Eventing is disabled",
        );
        return Ok(());
    }
    match ctx.eventing.reconcile_eventing(lf).await {
        Ok(outcome) => {
            debug!(?outcome, "eventing reconciled");
            lf.status_mut().set_condition(
                ConditionType::EventingReady,
                true,
                "EventingReady",
                "Broker and trigger are in place",
            );
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "eventing reconcile failed");
            ctx.metrics.record_error("eventing", e.metric_label());
            lf.status_mut().set_condition(
                ConditionType::EventingReady,
                false,
                "EventingFailed",
                e.to_string(),
            );
            Err(e)
        }
    }
}

async fn pending(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    let strategy = lf.strategy();

    if let Err(e) = validation::validate(&lf.spec, strategy) {
        warn!(error = %e, "validation failed");
        ctx.metrics.record_error("validator", "validation_failed");
        lf.status_mut().set_condition(
            ConditionType::SourceReady,
            false,
            "ValidationFailed",
            e.to_string(),
        );
        persist(lf, ctx).await?;
        return Ok(Requeue::Long);
    }

    if sync_eventing(lf, ctx).await.is_err() {
        persist(lf, ctx).await?;
        return Ok(Requeue::Short);
    }

    match strategy {
        DeploymentStrategy::Receiver => match ctx.config.receiver_image() {
            Ok(image) => skip_build(lf, ctx, image, "Receiver mode runs the operator image").await,
            Err(e) => {
                warn!(error = %e, "cannot resolve receiver image");
                ctx.metrics.record_error("reconciler", e.metric_label());
                lf.status_mut().set_condition(
                    ConditionType::SourceReady,
                    false,
                    "ReceiverImageUnavailable",
                    e.to_string(),
                );
                persist(lf, ctx).await?;
                Ok(Requeue::Long)
            }
        },
        DeploymentStrategy::PrebuiltImage => {
            let image = match lf.spec.source.resolve()? {
                Source::Image(image) => image.reference(),
                _ => return Err(SourceError::MissingBlock("image").into()),
            };
            skip_build(lf, ctx, image, "Deploying a prebuilt image").await
        }
        DeploymentStrategy::Build => start_build(lf, ctx).await,
    }
}

async fn skip_build(lf: &mut LambdaFunction, ctx: &Ctx, image: String, message: &str) -> Result<Requeue, Error> {
    let now = timestamp();
    let generation = lf.generation();
    let status = lf.status_mut();
    status.phase = Phase::Deploying;
    status.build_status = Some(BuildStatus {
        task_name: None,
        image_uri: Some(image),
        started_at: Some(now.clone()),
        completed_at: Some(now),
        attempt: 1,
        error: None,
    });
    status.set_condition(ConditionType::SourceReady, true, "SourceResolved", "Image resolved");
    status.set_condition(ConditionType::BuildReady, true, "BuildSkipped", message);
    status.observed_generation = Some(generation);
    persist(lf, ctx).await?;
    Ok(Requeue::Immediate)
}

async fn start_build(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    let context = match ctx.builder.create_build_context(lf).await {
        Ok(context) => context,
        Err(e) => {
            warn!(error = %e, "staging build context failed");
            ctx.metrics.record_error("build", "context_failed");
            lf.status_mut().set_condition(
                ConditionType::SourceReady,
                false,
                "BuildContextFailed",
                e.to_string(),
            );
            persist(lf, ctx).await?;
            return Ok(Requeue::Short);
        }
    };
    lf.status_mut().set_condition(
        ConditionType::SourceReady,
        true,
        "BuildContextCreated",
        format!("Build context {} staged", context.config_map),
    );

    let task = match ctx.builder.create_build_task(lf, &context).await {
        Ok(task) => task,
        Err(e) => {
            warn!(error = %e, "creating build task failed");
            ctx.metrics.record_error("build", "task_failed");
            lf.status_mut().set_condition(
                ConditionType::BuildReady,
                false,
                "BuildTaskFailed",
                e.to_string(),
            );
            persist(lf, ctx).await?;
            return Ok(Requeue::Short);
        }
    };

    let attempt = next_attempt(lf);
    let generation = lf.generation();
    let status = lf.status_mut();
    status.phase = Phase::Building;
    status.build_status = Some(BuildStatus {
        task_name: Some(task.clone()),
        image_uri: None,
        started_at: Some(timestamp()),
        completed_at: None,
        attempt,
        error: None,
    });
    status.set_condition(
        ConditionType::BuildReady,
        false,
        "BuildInProgress",
        format!("Build task {task} is running"),
    );
    status.observed_generation = Some(generation);
    persist(lf, ctx).await?;

    info!(%task, attempt, image = %context.image_uri, "build started");
    ctx.notifier.notify(lf, Notification::BuildStarted { task });
    Ok(Requeue::Short)
}

async fn building(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    let Some(task) = build_status(lf).and_then(|b| b.task_name.clone()) else {
        return reset_to_pending(lf, ctx, "no build task recorded").await;
    };
    let namespace = lf.namespace().unwrap_or_default();

    let progress = match ctx.builder.get_build_status(&namespace, &task).await {
        Ok(progress) => progress,
        Err(e) if e.is_not_found() => {
            return reset_to_pending(lf, ctx, "build task disappeared").await;
        }
        Err(e) => return Err(e),
    };
    if !progress.completed {
        debug!(%task, "build still running");
        return Ok(Requeue::Short);
    }

    let runtime = runtime_label(lf);
    let elapsed = build_status(lf)
        .and_then(|b| b.started_at.as_deref())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .and_then(|started| (Utc::now() - started.with_timezone(&Utc)).to_std().ok());
    let image = progress.image_uri.filter(|_| progress.success);

    let status = lf.status_mut();
    let build = status.build_status.get_or_insert_with(BuildStatus::default);
    build.completed_at = Some(timestamp());

    match image {
        Some(image) => {
            build.image_uri = Some(image.clone());
            build.error = None;
            status.phase = Phase::Deploying;
            status.set_condition(
                ConditionType::BuildReady,
                true,
                "BuildSucceeded",
                format!("Built {image}"),
            );
            persist(lf, ctx).await?;

            info!(%task, %image, "build succeeded");
            ctx.metrics.record_build(runtime, true, elapsed);
            ctx.notifier.notify(lf, Notification::BuildCompleted { image });
            Ok(Requeue::Immediate)
        }
        None => {
            let error = match progress.error {
                Some(error) => error,
                None if progress.success => "build finished without reporting an image".to_string(),
                None => "build task failed".to_string(),
            };
            build.error = Some(error.clone());
            status.phase = Phase::Failed;
            status.set_condition(ConditionType::BuildReady, false, "BuildFailed", error.clone());
            persist(lf, ctx).await?;

            warn!(%task, %error, "build failed");
            ctx.metrics.record_build(runtime, false, elapsed);
            ctx.metrics.record_error("build", "build_failed");
            ctx.notifier.notify(lf, Notification::BuildFailed { error });
            Ok(Requeue::AwaitChange)
        }
    }
}

fn service_status(service: &DynamicObject, health: &ServiceHealth) -> ServiceStatus {
    ServiceStatus {
        service_name: service.name_any(),
        url: health.url.clone(),
        ready: health.ready,
        replicas: health.replicas,
        latest_revision: health.latest_revision.clone(),
    }
}

async fn deploying(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    let Some(built) = build_status(lf).and_then(|b| b.image_uri.clone()) else {
        return reset_to_pending(lf, ctx, "no image recorded").await;
    };
    let strategy = lf.strategy();
    let image = match strategy {
        DeploymentStrategy::Receiver => ctx.config.receiver_image().unwrap_or_else(|e| {
            warn!(error = %e, "keeping recorded receiver image");
            built
        }),
        _ => built,
    };

    // Failures here are reported on the condition but do not hold up the service.
    let _ = sync_eventing(lf, ctx).await;

    let service = match ctx.deployer.get_service(lf).await? {
        None => match ctx.deployer.create_service(lf, &image).await {
            Ok(service) => {
                info!(%image, "service created");
                ctx.notifier.notify(lf, Notification::ServiceCreated { image: image.clone() });
                service
            }
            Err(e) => {
                warn!(error = %e, "creating service failed");
                ctx.metrics.record_error("deploy", "service_creation_failed");
                lf.status_mut().set_condition(
                    ConditionType::DeployReady,
                    false,
                    "ServiceCreationFailed",
                    e.to_string(),
                );
                persist(lf, ctx).await?;
                return Ok(Requeue::Short);
            }
        },
        Some(service) if service_generation(&service) != Some(lf.generation()) => {
            info!(%image, generation = lf.generation(), "service spec is stale, updating");
            ctx.deployer.update_service(lf, &service, &image).await?
        }
        Some(service) if service_image(&service) != Some(image.as_str()) => {
            info!(
                current = ?service_image(&service),
                desired = %image,
                "service image drifted, updating"
            );
            ctx.deployer.update_service_image(&service, &image).await?
        }
        Some(service) => service,
    };

    let health = ctx.deployer.get_service_status(&service).await;
    let status = lf.status_mut();
    if let Some(build) = status.build_status.as_mut() {
        build.image_uri = Some(image);
    }
    status.service_status = Some(service_status(&service, &health));

    if health.ready {
        status.phase = Phase::Ready;
        status.set_condition(
            ConditionType::DeployReady,
            true,
            "ServiceDeployed",
            "Service is deployed",
        );
        status.set_condition(
            ConditionType::ServiceReady,
            true,
            "ServiceReady",
            format!("Serving at {}", health.url.as_deref().unwrap_or("<pending>")),
        );
        persist(lf, ctx).await?;
        Ok(Requeue::Medium)
    } else {
        status.set_condition(
            ConditionType::DeployReady,
            false,
            "ServiceDeploying",
            "Waiting for the service to become ready",
        );
        persist(lf, ctx).await?;
        Ok(Requeue::Short)
    }
}

async fn ready(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    if lf.spec_changed() {
        return reset_to_pending(lf, ctx, "spec changed").await;
    }

    let Some(service) = ctx.deployer.get_service(lf).await? else {
        warn!("service disappeared");
        ctx.metrics.record_error("deploy", "service_missing");
        let status = lf.status_mut();
        status.phase = Phase::Failed;
        status.service_status = None;
        status.set_condition(
            ConditionType::ServiceReady,
            false,
            "ServiceMissing",
            "Service no longer exists",
        );
        persist(lf, ctx).await?;
        return Ok(Requeue::Long);
    };

    let health = ctx.deployer.get_service_status(&service).await;
    let previous = lf.status.clone();
    let status = lf.status_mut();
    status.service_status = Some(service_status(&service, &health));
    if !health.ready {
        status.phase = Phase::Failed;
        status.set_condition(
            ConditionType::ServiceReady,
            false,
            "ServiceUnhealthy",
            "Service is no longer ready",
        );
    }

    if lf.status != previous {
        persist(lf, ctx).await?;
    }
    Ok(if health.ready { Requeue::Medium } else { Requeue::Long })
}

async fn failed(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    if lf.spec_changed() {
        return reset_to_pending(lf, ctx, "spec changed").await;
    }
    Ok(Requeue::Long)
}

async fn delete(lf: &mut LambdaFunction, ctx: &Ctx) -> Result<Requeue, Error> {
    if !has_finalizer(lf, FINALIZER) {
        return Ok(Requeue::AwaitChange);
    }
    let namespace = lf.namespace().unwrap_or_default();

    if lf.phase() != Phase::Deleting {
        lf.status_mut().phase = Phase::Deleting;
        match persist(lf, ctx).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
    }

    if lf.eventing_enabled() {
        if let Err(e) = ctx.eventing.delete_eventing(lf).await {
            warn!(error = %e, "deleting trigger failed, continuing");
            ctx.metrics.record_error("eventing", e.metric_label());
        }
    }

    if let Err(e) = ctx.deployer.delete_service(lf).await {
        ctx.metrics.record_error("deploy", e.metric_label());
        return Err(e);
    }
    ctx.notifier.notify(lf, Notification::ServiceDeleted);

    if let Some(task) = build_status(lf).and_then(|b| b.task_name.clone()) {
        if let Err(e) = ctx.builder.delete_build_task(&namespace, &task).await {
            warn!(error = %e, %task, "deleting build task failed, continuing");
            ctx.metrics.record_error("build", e.metric_label());
        }
    }

    ctx.store.remove_finalizer(lf).await?;
    info!("cleanup finished, finalizer removed");
    Ok(Requeue::AwaitChange)
}
