/**
 * SYMBION FLEETCTL - Point d'entrée CLI de la flotte GPU
 *
 * RÔLE : .env + config YAML, logs tracing sur stderr, restauration et
 * sauvegarde de l'état du registre, puis une sous-commande.
 *
 * CODE RETOUR : 0 dès que la commande a tourné (même avec des nœuds en
 * échec), 1 pour une erreur de requête ou de config.
 */

mod commands;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use symbion_fleet::{load_config, load_config_from, Fleet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::Command;

#[derive(Parser, Debug)]
#[command(name = "symbion-fleetctl", version, about = "Symbion GPU fleet operations")]
struct Cli {
    /// Fleet config file (default: $SYMBION_FLEET_CONFIG or fleet.yaml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => load_config().await.context("loading fleet config")?,
    };
    let mut fleet = Fleet::over_ssh(&config).context("building fleet")?;

    if let Some(path) = &config.state_file {
        if path.exists() {
            match fleet.registry_mut().restore_state(path).await {
                Ok(restored) => info!(restored, path = %path.display(), "registry state restored"),
                Err(e) => warn!(error = %e, path = %path.display(), "ignoring unreadable state file"),
            }
        }
    }

    let mut stdout = std::io::stdout();
    let result = commands::run(cli.command, &mut fleet, &config, &mut stdout).await;

    if let Some(path) = &config.state_file {
        if let Err(e) = fleet.registry().save_state(path).await {
            warn!(error = %e, path = %path.display(), "failed to save registry state");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec_with_nodes() {
        let cli = Cli::try_parse_from(["symbion-fleetctl", "exec", "uptime", "--nodes", "n1,n2"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Exec { command: "uptime".into(), nodes: Some(vec!["n1".into(), "n2".into()]) }
        );
    }

    #[test]
    fn test_parse_deploy_defaults_to_ten_replicas() {
        let cli = Cli::try_parse_from(["symbion-fleetctl", "deploy", "ai-inference"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Deploy { workload: "ai-inference".into(), replicas: 10, nodes: None }
        );
    }

    #[test]
    fn test_parse_global_config_flag() {
        let cli = Cli::try_parse_from(["symbion-fleetctl", "status", "--detailed", "-c", "/etc/fleet.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/fleet.yaml")));
        assert_eq!(cli.command, Command::Status { detailed: true });
    }

    #[test]
    fn test_parse_kebab_case_subcommands() {
        assert!(Cli::try_parse_from(["symbion-fleetctl", "docker-status"]).is_ok());
        let cli = Cli::try_parse_from(["symbion-fleetctl", "nvidia-smi", "--query", "--query-gpu=name"]).unwrap();
        assert_eq!(cli.command, Command::NvidiaSmi { query: Some("--query-gpu=name".into()) });
        assert!(Cli::try_parse_from(["symbion-fleetctl", "monitor", "--live"]).is_ok());
        assert_eq!(Cli::try_parse_from(["symbion-fleetctl", "k8s-deploy"]).unwrap().command, Command::K8sDeploy);
    }

    #[test]
    fn test_parse_deploy_service() {
        let cli = Cli::try_parse_from(["symbion-fleetctl", "deploy-service", "llm-gateway", "--nodes", "n2"]).unwrap();
        assert_eq!(
            cli.command,
            Command::DeployService { service: "llm-gateway".into(), replicas: 10, nodes: Some(vec!["n2".into()]) }
        );
    }
}
