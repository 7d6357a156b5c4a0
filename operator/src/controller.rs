use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, info, warn};

use crate::context::Ctx;
use crate::crd::LambdaFunction;
use crate::deploy::service_resource;
use crate::eventing::trigger_resource;
use crate::reconcile::{error_policy, reconcile};

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn scoped_dynamic(client: &Client, namespace: Option<&str>, ar: &ApiResource) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

/// Runs the LambdaFunction controller until SIGINT or SIGTERM.
pub async fn run(client: Client, ctx: Arc<Ctx>) {
    let namespace = ctx.config.controller.namespace.clone();
    let namespace = namespace.as_deref();
    let wc = watcher::Config::default();
    let service = service_resource();
    let trigger = trigger_resource();

    info!(
        namespace = namespace.unwrap_or("<all>"),
        concurrency = ctx.config.controller.concurrency,
        "starting controller"
    );

    Controller::new(scoped::<LambdaFunction>(&client, namespace), wc.clone())
        .owns(scoped::<Job>(&client, namespace), wc.clone())
        .owns(scoped::<ConfigMap>(&client, namespace), wc.clone())
        .owns_with(scoped_dynamic(&client, namespace, &service), service.clone(), wc.clone())
        .owns_with(scoped_dynamic(&client, namespace, &trigger), trigger.clone(), wc)
        .with_config(controller::Config::default().concurrency(ctx.config.controller.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(
                    namespace = ?obj.namespace,
                    name = %obj.name,
                    ?action,
                    "reconciled"
                ),
                Err(controller::Error::ReconcilerFailed(e, obj)) => warn!(
                    namespace = ?obj.namespace,
                    name = %obj.name,
                    error = %e,
                    "reconcile failed"
                ),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    info!("controller stopped");
}
