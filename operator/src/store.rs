use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::LambdaFunction;
use crate::error::Error;
use crate::event::Outcome;
use crate::finalizer::{FINALIZER, finalizers_patch, with_finalizer, without_finalizer};

/// Persistence of the function resource itself.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LambdaFunction>, Error>;

    /// Writes `lf.status` if `lf` still carries the current resource version.
    /// A stale version fails with a conflict. Returns the stored object.
    async fn update_status(&self, lf: &LambdaFunction) -> Result<LambdaFunction, Error>;

    async fn add_finalizer(&self, lf: &LambdaFunction) -> Result<Outcome, Error>;

    async fn remove_finalizer(&self, lf: &LambdaFunction) -> Result<Outcome, Error>;
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, lf: &LambdaFunction) -> Result<Api<LambdaFunction>, Error> {
        let ns = lf
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        Ok(Api::namespaced(self.client.clone(), &ns))
    }
}

fn stale(lf: &LambdaFunction, e: kube::Error) -> Error {
    let err = Error::from(e);
    if err.is_conflict() {
        Error::Conflict(format!(
            "{}/{}",
            lf.namespace().unwrap_or_default(),
            lf.name_any()
        ))
    } else {
        err
    }
}

#[async_trait]
impl FunctionStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LambdaFunction>, Error> {
        let api: Api<LambdaFunction> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_status(&self, lf: &LambdaFunction) -> Result<LambdaFunction, Error> {
        let patch = json!({
            "metadata": { "resourceVersion": lf.resource_version() },
            "status": lf.status,
        });
        let stored = self
            .api(lf)?
            .patch_status(&lf.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| stale(lf, e))?;
        debug!(
            name = %lf.name_any(),
            phase = %lf.phase(),
            resource_version = ?stored.resource_version(),
            "status written"
        );
        Ok(stored)
    }

    async fn add_finalizer(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
        let Some(finalizers) = with_finalizer(lf, FINALIZER) else {
            return Ok(Outcome::NoOp);
        };
        let patch = finalizers_patch(lf, &finalizers);
        self.api(lf)?
            .patch_metadata(&lf.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| stale(lf, e))?;
        Ok(Outcome::Created)
    }

    async fn remove_finalizer(&self, lf: &LambdaFunction) -> Result<Outcome, Error> {
        let Some(finalizers) = without_finalizer(lf, FINALIZER) else {
            return Ok(Outcome::NoOp);
        };
        let patch = finalizers_patch(lf, &finalizers);
        match self
            .api(lf)?
            .patch_metadata(&lf.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(Outcome::Updated),
            Err(e) => {
                let err = stale(lf, e);
                if err.is_not_found() { Ok(Outcome::NoOp) } else { Err(err) }
            }
        }
    }
}
