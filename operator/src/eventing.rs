use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::core::gvk::GroupVersionKind;
use kube::{Client, Resource, ResourceExt};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::config::EventingConfig;
use crate::crd::{DeploymentStrategy, LambdaFunction, MANAGED_BY, NAME_LABEL};
use crate::error::Error;
use crate::event::Outcome;

pub const PARALLELISM_ANNOTATION: &str = "rabbitmq.eventing.knative.dev/parallelism";
pub const BROKER_CLASS_ANNOTATION: &str = "eventing.knative.dev/broker.class";

pub fn broker_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("eventing.knative.dev", "v1", "Broker"),
        "brokers",
    )
}

pub fn trigger_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("eventing.knative.dev", "v1", "Trigger"),
        "triggers",
    )
}

#[async_trait]
pub trait EventingCoordinator: Send + Sync {
    /// Makes sure the broker exists and the trigger matches the function spec.
    async fn reconcile_eventing(&self, lf: &LambdaFunction) -> Result<Outcome, Error>;

    /// Removes the trigger. The broker is shared and stays.
    async fn delete_eventing(&self, lf: &LambdaFunction) -> Result<(), Error>;
}

pub struct KnativeEventing {
    client: Client,
    config: EventingConfig,
    broker: ApiResource,
    trigger: ApiResource,
}

impl KnativeEventing {
    pub fn new(client: Client, config: EventingConfig) -> Self {
        Self {
            client,
            config,
            broker: broker_resource(),
            trigger: trigger_resource(),
        }
    }

    async fn ensure_broker(&self, namespace: &str, name: &str) -> Result<Outcome, Error> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.broker);
        if api.get_opt(name).await?.is_some() {
            return Ok(Outcome::NoOp);
        }

        let broker = render_broker(namespace, name, &self.config, &self.broker);
        match api.create(&PostParams::default(), &broker).await {
            Ok(_) => {
                info!(%namespace, broker = %name, "created broker");
                Ok(Outcome::Created)
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() { Ok(Outcome::NoOp) } else { Err(err) }
            }
        }
    }

    async fn ensure_trigger(&self, lf: &LambdaFunction, broker: &str) -> Result<Outcome, Error> {
        let desired = render_trigger(lf, broker, &self.config, &self.trigger)?;
        let namespace = desired
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = desired.name_any();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &namespace, &self.trigger);

        let Some(existing) = api.get_opt(&name).await? else {
            return match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    info!(%namespace, trigger = %name, %broker, "created trigger");
                    Ok(Outcome::Created)
                }
                Err(e) => {
                    let err = Error::from(e);
                    if err.is_already_exists() { Ok(Outcome::NoOp) } else { Err(err) }
                }
            };
        };

        if trigger_matches(&existing, &desired) {
            debug!(%namespace, trigger = %name, "trigger up to date");
            return Ok(Outcome::NoOp);
        }

        let mut replacement = desired;
        replacement.metadata.resource_version = existing.resource_version();
        api.replace(&name, &PostParams::default(), &replacement).await?;
        info!(%namespace, trigger = %name, "updated trigger");
        Ok(Outcome::Updated)
    }
}

#[async_trait]
impl EventingCoordinator for KnativeEventing {
    async fn reconcile_eventing(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
        let namespace = lf
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let broker = broker_name(lf, &self.config);

        let broker_outcome = self.ensure_broker(&namespace, &broker).await?;
        let trigger_outcome = self.ensure_trigger(lf, &broker).await?;

        Ok(match trigger_outcome {
            Outcome::NoOp => broker_outcome,
            changed => changed,
        })
    }

    async fn delete_eventing(&self, lf: &LambdaFunction) -> Result<(), Error> {
        let namespace = lf
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &namespace, &self.trigger);
        match api.delete(&trigger_name(&lf.name_any()), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }
}

pub fn trigger_name(function: &str) -> String {
    format!("{function}-trigger")
}

/// The function's own broker name, else the namespace-wide default.
pub fn broker_name(lf: &LambdaFunction, cfg: &EventingConfig) -> String {
    lf.spec
        .eventing
        .as_ref()
        .and_then(|e| e.broker_name.as_deref())
        .filter(|b| !b.is_empty())
        .unwrap_or(&cfg.broker_name)
        .to_string()
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string())])
}

/// Brokers are shared between functions, so they carry no owner reference.
pub fn render_broker(namespace: &str, name: &str, cfg: &EventingConfig, resource: &ApiResource) -> DynamicObject {
    let mut broker = DynamicObject::new(name, resource).within(namespace).data(json!({
        "spec": {
            "delivery": {
                "retry": cfg.retry,
                "backoffPolicy": cfg.backoff_policy,
                "backoffDelay": cfg.backoff_delay,
            },
        },
    }));
    broker.metadata.labels = Some(managed_labels());
    if let Some(class) = cfg.broker_class.as_ref() {
        broker.metadata.annotations = Some(BTreeMap::from([(
            BROKER_CLASS_ANNOTATION.to_string(),
            class.clone(),
        )]));
    }
    broker
}

pub fn render_trigger(
    lf: &LambdaFunction,
    broker: &str,
    cfg: &EventingConfig,
    resource: &ApiResource,
) -> Result<DynamicObject, Error> {
    let name = lf.name_any();
    let namespace = lf
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let owner = lf
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let eventing = lf.spec.eventing.clone().unwrap_or_default();

    let mut spec = Map::new();
    spec.insert("broker".into(), json!(broker));
    // Receivers take every event on the broker.
    if lf.strategy() != DeploymentStrategy::Receiver {
        let mut attributes = eventing.filter.clone();
        attributes.insert("subject".into(), name.clone());
        spec.insert("filter".into(), json!({ "attributes": attributes }));
    }
    spec.insert(
        "subscriber".into(),
        json!({
            "ref": {
                "apiVersion": "serving.knative.dev/v1",
                "kind": "Service",
                "name": name,
                "namespace": namespace,
            },
        }),
    );
    if let Some(delivery) = eventing.delivery.as_ref() {
        let mut d = Map::new();
        if let Some(retry) = delivery.retry {
            d.insert("retry".into(), json!(retry));
        }
        if let Some(policy) = delivery.backoff_policy.as_ref() {
            d.insert("backoffPolicy".into(), json!(policy));
        }
        if let Some(delay) = delivery.backoff_delay.as_ref() {
            d.insert("backoffDelay".into(), json!(delay));
        }
        if let Some(uri) = delivery.dead_letter_uri.as_ref() {
            d.insert("deadLetterSink".into(), json!({ "uri": uri }));
        }
        if !d.is_empty() {
            spec.insert("delivery".into(), Value::Object(d));
        }
    }

    let parallelism = eventing.parallelism.unwrap_or(cfg.parallelism);
    let mut labels = managed_labels();
    labels.insert(NAME_LABEL.into(), name.clone());

    let mut trigger = DynamicObject::new(&trigger_name(&name), resource)
        .within(&namespace)
        .data(json!({ "spec": spec }));
    trigger.metadata.labels = Some(labels);
    trigger.metadata.annotations = Some(BTreeMap::from([(
        PARALLELISM_ANNOTATION.to_string(),
        parallelism.to_string(),
    )]));
    trigger.metadata.owner_references = Some(vec![owner]);
    Ok(trigger)
}

/// Server-side defaults are tolerated everywhere except the filter, which
/// must match exactly so removed attributes get dropped.
pub fn trigger_matches(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    let parallelism = |o: &DynamicObject| o.annotations().get(PARALLELISM_ANNOTATION).cloned();
    let filter = |o: &DynamicObject| o.data.pointer("/spec/filter").cloned();

    parallelism(existing) == parallelism(desired)
        && filter(existing) == filter(desired)
        && contains(&existing.data["spec"], &desired.data["spec"])
}

fn contains(actual: &Value, wanted: &Value) -> bool {
    match (actual, wanted) {
        (Value::Object(a), Value::Object(w)) => w
            .iter()
            .all(|(k, v)| a.get(k).is_some_and(|av| contains(av, v))),
        _ => actual == wanted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(eventing: Value, annotations: Value) -> LambdaFunction {
        serde_json::from_value(json!({
            "apiVersion": "lambda.knative.io/v1alpha1",
            "kind": "LambdaFunction",
            "metadata": {
                "name": "hello",
                "namespace": "team-a",
                "uid": "1234",
                "annotations": annotations,
            },
            "spec": {
                "source": { "type": "inline", "inline": { "code": "x" } },
                "runtime": { "language": "python", "version": "3.12" },
                "eventing": eventing,
            },
        }))
        .unwrap()
    }

    fn trigger(lf: &LambdaFunction) -> DynamicObject {
        let cfg = EventingConfig::default();
        render_trigger(lf, &broker_name(lf, &cfg), &cfg, &trigger_resource()).unwrap()
    }

    #[test]
    fn trigger_filters_on_subject_and_extra_attributes() {
        let lf = function(
            json!({ "filter": { "type": "order.created" }, "parallelism": 4 }),
            json!({}),
        );
        let t = trigger(&lf);

        assert_eq!(t.name_any(), "hello-trigger");
        assert_eq!(t.owner_references()[0].uid, "1234");
        assert_eq!(t.data["spec"]["broker"], "lambda-broker");
        assert_eq!(
            t.data["spec"]["filter"]["attributes"],
            json!({ "subject": "hello", "type": "order.created" })
        );
        assert_eq!(t.data["spec"]["subscriber"]["ref"]["kind"], "Service");
        assert_eq!(t.data["spec"]["subscriber"]["ref"]["name"], "hello");
        assert_eq!(t.annotations().get(PARALLELISM_ANNOTATION).map(String::as_str), Some("4"));
        assert!(t.data["spec"].get("delivery").is_none());
    }

    #[test]
    fn receiver_trigger_has_no_filter() {
        let lf = function(
            json!({ "brokerName": "orders" }),
            json!({ "lambda.knative.io/use-operator-image": "true" }),
        );
        let t = trigger(&lf);

        assert_eq!(t.data["spec"]["broker"], "orders");
        assert!(t.data["spec"].get("filter").is_none());
        assert_eq!(t.annotations().get(PARALLELISM_ANNOTATION).map(String::as_str), Some("50"));
    }

    #[test]
    fn trigger_delivery_is_rendered_when_set() {
        let lf = function(
            json!({ "delivery": { "retry": 3, "deadLetterUri": "http://dlq.team-a.svc" } }),
            json!({}),
        );
        let t = trigger(&lf);
        assert_eq!(
            t.data["spec"]["delivery"],
            json!({ "retry": 3, "deadLetterSink": { "uri": "http://dlq.team-a.svc" } })
        );
    }

    #[test]
    fn broker_is_unowned_with_delivery_policy() {
        let cfg = EventingConfig {
            broker_class: Some("RabbitMQBroker".into()),
            ..Default::default()
        };
        let b = render_broker("team-a", "lambda-broker", &cfg, &broker_resource());

        assert!(b.metadata.owner_references.is_none());
        assert_eq!(b.namespace().as_deref(), Some("team-a"));
        assert_eq!(b.data["spec"]["delivery"]["retry"], 5);
        assert_eq!(b.data["spec"]["delivery"]["backoffDelay"], "PT1S");
        assert_eq!(
            b.annotations().get(BROKER_CLASS_ANNOTATION).map(String::as_str),
            Some("RabbitMQBroker")
        );
    }

    #[test]
    fn matching_tolerates_server_defaults_but_not_filter_drift() {
        let lf = function(json!({ "filter": { "type": "a" } }), json!({}));
        let desired = trigger(&lf);

        let mut existing = desired.clone();
        existing.data["spec"]["subscriber"]["uri"] = json!("http://hello.team-a.svc.cluster.local");
        assert!(trigger_matches(&existing, &desired));

        existing.data["spec"]["filter"]["attributes"]["source"] = json!("stale");
        assert!(!trigger_matches(&existing, &desired));

        let mut existing = desired.clone();
        existing
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(PARALLELISM_ANNOTATION.into(), "10".into());
        assert!(!trigger_matches(&existing, &desired));

        let mut existing = desired.clone();
        existing.data["spec"]["broker"] = json!("other");
        assert!(!trigger_matches(&existing, &desired));
    }
}
