use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context as _, bail};
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

use lambda_operator::cli::{Cli, Command, Mode};
use lambda_operator::config::Config;
use lambda_operator::context::Ctx;
use lambda_operator::crd::LambdaFunction;
use lambda_operator::leader::LeaderElector;
use lambda_operator::metrics::Metrics;
use lambda_operator::receiver::{self, KubeCommands, ReceiverState};
use lambda_operator::server::{self, AppState, shutdown_signal};
use lambda_operator::{controller, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&LambdaFunction::crd())?);
            Ok(())
        }
        Command::Run => {
            let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
            config.controller.leader_elect |= cli.leader_elect;
            match cli.mode {
                Mode::Controller => run_controller(config).await,
                Mode::Receiver => run_receiver(config).await,
            }
        }
    }
}

async fn run_controller(config: Config) -> anyhow::Result<()> {
    telemetry::init(config.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting lambda-operator");

    let client = Client::try_default().await.context("connecting to the cluster")?;
    let metrics = Metrics::new()?;
    let addr = config.server.address;
    let state = AppState::new(metrics.clone());
    let elector = config
        .controller
        .leader_elect
        .then(|| LeaderElector::new(client.clone(), &config.controller, LeaderElector::default_identity()));
    let ctx = Arc::new(Ctx::new(client.clone(), config, metrics)?);

    let mut server = tokio::spawn(server::serve(addr, state.clone()));

    if let Some(elector) = elector.as_ref() {
        tokio::select! {
            () = elector.acquire() => {}
            () = shutdown_signal() => return Ok(()),
        }
    }
    state.ready.store(true, Ordering::SeqCst);

    let lost = async {
        match elector.as_ref() {
            Some(elector) => elector.hold().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = controller::run(client, ctx) => {
            if let Some(elector) = elector.as_ref() {
                if let Err(e) = elector.release().await {
                    warn!(error = %e, "releasing leadership failed");
                }
            }
            server.await.context("HTTP server task panicked")?.context("HTTP server failed")?;
        }
        () = lost => {
            bail!("leadership lost; exiting so another replica can take over");
        }
        res = &mut server => {
            res.context("HTTP server task panicked")?.context("HTTP server failed")?;
        }
    }
    info!("lambda-operator shut down");
    Ok(())
}

async fn run_receiver(config: Config) -> anyhow::Result<()> {
    telemetry::init(config.log_format)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        default_namespace = %config.receiver.default_namespace,
        "starting CloudEvents receiver"
    );

    let client = Client::try_default().await.context("connecting to the cluster")?;
    let metrics = Metrics::new()?;
    let state = ReceiverState::new(Arc::new(KubeCommands::new(client)), metrics, &config.receiver);

    receiver::serve(config.receiver.address(), state)
        .await
        .context("CloudEvents receiver failed")?;
    info!("receiver shut down");
    Ok(())
}
