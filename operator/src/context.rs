use std::sync::Arc;

use kube::Client;

use crate::builder::{BuildCoordinator, BuildKitBuilder};
use crate::config::Config;
use crate::deploy::{DeployCoordinator, KnativeDeployer};
use crate::error::Error;
use crate::event::Notifier;
use crate::eventing::{EventingCoordinator, KnativeEventing};
use crate::metrics::Metrics;
use crate::store::{FunctionStore, KubeStore};

/// Collaborators shared by every reconcile.
#[derive(Clone)]
pub struct Ctx {
    pub store: Arc<dyn FunctionStore>,
    pub builder: Arc<dyn BuildCoordinator>,
    pub deployer: Arc<dyn DeployCoordinator>,
    pub eventing: Arc<dyn EventingCoordinator>,
    pub notifier: Notifier,
    pub metrics: Metrics,
    pub config: Arc<Config>,
}

impl Ctx {
    pub fn new(client: Client, config: Config, metrics: Metrics) -> Result<Self, Error> {
        let notifier = Notifier::from_config(client.clone(), &config.notifications, metrics.clone())?;
        Ok(Self {
            store: Arc::new(KubeStore::new(client.clone())),
            builder: Arc::new(BuildKitBuilder::new(client.clone(), config.build.clone())),
            deployer: Arc::new(KnativeDeployer::new(client.clone(), config.deploy.clone())),
            eventing: Arc::new(KnativeEventing::new(client, config.eventing.clone())),
            notifier,
            metrics,
            config: Arc::new(config),
        })
    }
}
