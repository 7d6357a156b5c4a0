use kube::{Resource, ResourceExt};
use serde_json::{Value, json};

use crate::crd::LambdaFunction;

pub const FINALIZER: &str = "lambdafunction.lambda.knative.io/finalizer";

pub fn is_deleting(lf: &LambdaFunction) -> bool {
    lf.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer(lf: &LambdaFunction, finalizer: &str) -> bool {
    lf.finalizers().iter().any(|f| f == finalizer)
}

/// Finalizer list with `finalizer` appended, or `None` when it is already there.
pub fn with_finalizer(lf: &LambdaFunction, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(lf, finalizer) {
        return None;
    }
    let mut finalizers = lf.finalizers().to_vec();
    finalizers.push(finalizer.into());
    Some(finalizers)
}

/// Finalizer list without `finalizer`, or `None` when it was never there.
pub fn without_finalizer(lf: &LambdaFunction, finalizer: &str) -> Option<Vec<String>> {
    if !has_finalizer(lf, finalizer) {
        return None;
    }
    Some(
        lf.finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

/// Merge patch replacing the whole list, guarded by the resource version it was computed from.
pub fn finalizers_patch(lf: &LambdaFunction, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": lf.resource_version(),
        }
    })
}
