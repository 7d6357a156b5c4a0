use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "lambda-operator", version, about = "Builds and serves LambdaFunction resources on Knative")]
pub struct Cli {
    /// Configuration file (YAML or JSON).
    #[arg(long, env = "LAMBDA_OPERATOR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Process to run: the controller, or the CloudEvents receiver that
    /// receiver-strategy services start.
    #[arg(long, value_enum, default_value_t = Mode::Controller, global = true)]
    pub mode: Mode,

    /// Reconcile only while holding the leader Lease.
    #[arg(long, global = true)]
    pub leader_elect: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Controller,
    Receiver,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the selected mode (the default).
    Run,
    /// Print the LambdaFunction CustomResourceDefinition as YAML.
    Crd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use crate::deploy::{render_service, service_resource};
    use crate::testing::function;
    use serde_json::json;

    #[test]
    fn defaults_to_controller_run() {
        let cli = Cli::try_parse_from(["lambda-operator"]).unwrap();
        assert_eq!(cli.mode, Mode::Controller);
        assert!(!cli.leader_elect);
        assert_eq!(cli.command, None);

        let cli = Cli::try_parse_from(["lambda-operator", "crd"]).unwrap();
        assert_eq!(cli.command, Some(Command::Crd));
    }

    #[test]
    fn receiver_service_args_are_accepted() {
        let lf = function(json!({
            "source": { "type": "inline", "inline": { "code": "x" } },
            "runtime": { "language": "python", "version": "3.12" },
            "strategy": "receiver"
        }));
        let image = "localhost:5001/knative-lambda-operator:1.0.0";
        let svc = render_service(&lf, image, &DeployConfig::default(), &service_resource()).unwrap();
        let args: Vec<String> = serde_json::from_value(
            svc.data["spec"]["template"]["spec"]["containers"][0]["args"].clone(),
        )
        .unwrap();

        let cli = Cli::try_parse_from(std::iter::once("lambda-operator".to_string()).chain(args)).unwrap();
        assert_eq!(cli.mode, Mode::Receiver);
        assert_eq!(cli.command, None);
    }

    #[test]
    fn leader_election_and_unknown_modes() {
        let cli = Cli::try_parse_from(["lambda-operator", "--leader-elect", "run"]).unwrap();
        assert!(cli.leader_elect);
        assert_eq!(cli.command, Some(Command::Run));

        assert!(Cli::try_parse_from(["lambda-operator", "--mode=webhook"]).is_err());
    }
}
