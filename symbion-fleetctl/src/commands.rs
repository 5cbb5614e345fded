/**
 * COMMANDES CLI - Une fonction par sous-commande
 *
 * RÔLE : Connexion, exécution, rendu texte vers un `Write` (stdout en prod,
 * buffer en test), déconnexion. Les échecs par nœud sont affichés, jamais
 * remontés : seules les erreurs de requête (id, workload ou nom de service
 * invalide) sortent en `Err`.
 */

use anyhow::Result;
use clap::Subcommand;
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use symbion_fleet::aggregator::{averages, totals};
use symbion_fleet::playbook::{
    condensed, Playbook, BEST_PRACTICES, DOCKER_STATUS, K8S_GPU_CLUSTER, NVIDIA_DIAGNOSTICS, PERFORMANCE_MONITORING,
};
use symbion_fleet::{ConnectResult, Fleet, FleetConfig, NodeId, OutcomeMap, StepReport, TelemetryCollector, WorkloadDistributor};
use tracing::{info, warn};

const DEFAULT_NVIDIA_QUERY: &str = "--query-gpu=index,name,temperature.gpu,utilization.gpu --format=csv";

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Connect to every fleet node and report the result per node
    Connect,

    /// Poll telemetry and print fleet statistics
    Status {
        /// Show one line per node
        #[arg(long)]
        detailed: bool,
    },

    /// Run a shell command across the fleet
    Exec {
        command: String,
        /// Specific nodes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Option<Vec<NodeId>>,
    },

    /// Deploy a workload: ai-inference, crypto-mining, akash-provider
    Deploy {
        workload: String,
        #[arg(long, default_value_t = 10)]
        replicas: usize,
        /// Specific nodes (comma-separated), overrides --replicas
        #[arg(long, value_delimiter = ',')]
        nodes: Option<Vec<NodeId>>,
    },

    /// Pull and run minechain/<service>:latest, stopping at the first failed step
    DeployService {
        service: String,
        #[arg(long, default_value_t = 10)]
        replicas: usize,
        /// Specific nodes (comma-separated), overrides --replicas
        #[arg(long, value_delimiter = ',')]
        nodes: Option<Vec<NodeId>>,
    },

    /// Install k3s everywhere, then GPU plugin and quota from the first node
    K8sDeploy,

    /// Apply system, GPU and docker tuning (sudo) on every node
    Optimize,

    /// Performance snapshot, or a live summary until Ctrl-C
    Monitor {
        #[arg(long)]
        live: bool,
    },

    /// Docker containers, stats and disk usage on every node
    DockerStatus,

    /// Run nvidia-smi across the fleet
    NvidiaSmi {
        /// Custom nvidia-smi arguments
        #[arg(long, allow_hyphen_values = true)]
        query: Option<String>,
    },

    /// NVIDIA clock and power diagnostics
    NvidiaMl,
}

pub async fn run<W: Write>(command: Command, fleet: &mut Fleet, config: &FleetConfig, out: &mut W) -> Result<()> {
    if command == Command::Connect {
        let results = fleet.connect_all().await;
        print_connect(&results, out)?;
        fleet.disconnect_all().await;
        return Ok(());
    }

    let results = fleet.connect_all().await;
    let online = results.values().filter(|r| r.is_ok()).count();
    info!(online, total = results.len(), "fleet connected");

    let outcome = dispatch(command, fleet, config, out).await;
    fleet.disconnect_all().await;
    outcome
}

async fn dispatch<W: Write>(command: Command, fleet: &mut Fleet, config: &FleetConfig, out: &mut W) -> Result<()> {
    match command {
        Command::Connect => Ok(()),
        Command::Status { detailed } => status(fleet, config, detailed, out).await,
        Command::Exec { command, nodes } => {
            writeln!(out, "Executing: {command}")?;
            let outcomes = fleet.execute(&command, nodes.as_deref()).await?;
            print_outcomes(&outcomes, out)
        }
        Command::Deploy { workload, replicas, nodes } => deploy(fleet, &workload, replicas, nodes, out).await,
        Command::DeployService { service, replicas, nodes } => {
            deploy_service(fleet, &service, replicas, nodes, out).await
        }
        Command::K8sDeploy => {
            writeln!(out, "Deploying Kubernetes GPU cluster")?;
            run_sequence(&K8S_GPU_CLUSTER, fleet, out).await?;
            writeln!(out, "Kubernetes GPU cluster deployed")?;
            Ok(())
        }
        Command::Optimize => {
            writeln!(out, "Implementing fleet best practices")?;
            run_sequence(&BEST_PRACTICES, fleet, out).await?;
            writeln!(out, "Best practices applied across fleet")?;
            Ok(())
        }
        Command::Monitor { live: false } => {
            writeln!(out, "Fleet performance monitoring")?;
            run_playbook(&PERFORMANCE_MONITORING, fleet, out, |text| condensed(text, 3)).await
        }
        Command::Monitor { live: true } => {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            monitor_live(fleet, config, out, ctrl_c).await
        }
        Command::DockerStatus => {
            writeln!(out, "Docker fleet status check")?;
            run_playbook(&DOCKER_STATUS, fleet, out, |text| text.to_string()).await
        }
        Command::NvidiaSmi { query } => {
            let query = query.as_deref().unwrap_or(DEFAULT_NVIDIA_QUERY);
            writeln!(out, "Running nvidia-smi {query} across fleet")?;
            let outcomes = fleet.execute(&format!("nvidia-smi {query}"), None).await?;
            print_outcomes(&outcomes, out)
        }
        Command::NvidiaMl => run_playbook(&NVIDIA_DIAGNOSTICS, fleet, out, |text| condensed(text, 1)).await,
    }
}

fn print_connect<W: Write>(results: &std::collections::BTreeMap<NodeId, ConnectResult>, out: &mut W) -> Result<()> {
    let ok = results.values().filter(|r| r.is_ok()).count();
    for (id, result) in results {
        match result {
            ConnectResult::Ok => writeln!(out, "  {id}: connected")?,
            ConnectResult::Failed { reason } => writeln!(out, "  {id}: FAILED ({reason})")?,
        }
    }
    writeln!(out, "Connected to {ok}/{} nodes", results.len())?;
    Ok(())
}

fn print_outcomes<W: Write>(outcomes: &OutcomeMap, out: &mut W) -> Result<()> {
    for (id, outcome) in outcomes {
        writeln!(out, "\n=== {id} ===")?;
        writeln!(out, "{outcome}")?;
    }
    Ok(())
}

async fn status<W: Write>(fleet: &mut Fleet, config: &FleetConfig, detailed: bool, out: &mut W) -> Result<()> {
    let report = TelemetryCollector::new(config.telemetry.clone()).poll(fleet, None).await?;
    let totals = totals(fleet.registry());

    writeln!(out, "Fleet Status:")?;
    writeln!(out)?;
    writeln!(out, "Fleet Overview:")?;
    writeln!(out, "  Total Nodes: {}", totals.total_nodes)?;
    writeln!(out, "  Online Nodes: {}", totals.online_nodes)?;
    writeln!(out, "  Total GPUs: {}", totals.total_gpus)?;
    writeln!(out, "  Total VRAM: {:.0} GB", totals.total_vram_gb)?;
    writeln!(out, "  Total RAM: {:.0} GB", totals.total_ram_gb)?;
    writeln!(out, "  Total Cores: {}", totals.total_cores)?;
    match averages(fleet.registry()) {
        Ok(avg) => {
            writeln!(out, "  Average GPU Temp: {:.1}°C", avg.avg_gpu_temp)?;
            writeln!(out, "  Average GPU Util: {:.1}%", avg.avg_gpu_util)?;
        }
        Err(e) => writeln!(out, "  Averages: n/a ({e})")?,
    }
    writeln!(out)?;

    if detailed {
        writeln!(out, "Node Details:")?;
        for node in fleet.registry().all() {
            writeln!(out, "  {}: {} - {}", node.id, node.status, node.workload)?;
            if let (true, Some(gpu)) = (node.is_online(), node.gpu.as_ref()) {
                writeln!(out, "    GPU: {}°C, {}%", gpu.temperature_c, gpu.utilization_pct)?;
            }
        }
        for failure in &report.parse_failures {
            writeln!(out, "  ! {}: {}", failure.node, failure.error)?;
        }
        writeln!(out)?;
    }

    writeln!(out, "Total Fleet Earnings: ${:.2}", totals.total_earnings)?;
    Ok(())
}

async fn deploy<W: Write>(
    fleet: &mut Fleet,
    workload: &str,
    replicas: usize,
    nodes: Option<Vec<NodeId>>,
    out: &mut W,
) -> Result<()> {
    let report = WorkloadDistributor::default()
        .distribute(fleet, workload, replicas, nodes.as_deref())
        .await?;

    writeln!(out, "Deploying {} across {} nodes", report.workload, report.targets.len())?;
    for step in &report.steps {
        print_step(step, out)?;
    }
    writeln!(out, "\n{} running on {}/{} nodes", report.workload, report.completed.len(), report.targets.len())?;
    Ok(())
}

async fn deploy_service<W: Write>(
    fleet: &mut Fleet,
    service: &str,
    replicas: usize,
    nodes: Option<Vec<NodeId>>,
    out: &mut W,
) -> Result<()> {
    let report = WorkloadDistributor::default()
        .deploy_service(fleet, service, replicas, nodes.as_deref())
        .await?;

    writeln!(out, "Deploying {} across {} nodes", report.service, report.targets.len())?;
    for step in &report.steps {
        print_step(step, out)?;
    }
    if report.deployed() {
        writeln!(out, "\n{} deployed successfully across {} nodes", report.service, report.targets.len())?;
    } else {
        for (id, error) in &report.failures {
            writeln!(out, "Deploy failed on {id}: {error}")?;
        }
    }
    Ok(())
}

fn print_step<W: Write>(step: &StepReport, out: &mut W) -> Result<()> {
    writeln!(out, "\n--- {} ---", step.command.lines().next().unwrap_or_default())?;
    writeln!(out, "  {}/{} nodes ok", step.success_count, step.target_count)?;
    for (id, outcome) in step.outcomes.iter().filter(|(_, o)| o.is_error()) {
        writeln!(out, "  {id}: {outcome}")?;
    }
    Ok(())
}

/// Séquence de provisioning : compte par étape, erreurs par nœud
async fn run_sequence<W: Write>(playbook: &Playbook, fleet: &mut Fleet, out: &mut W) -> Result<()> {
    for step in playbook.run(fleet, None).await? {
        print_step(&step, out)?;
    }
    Ok(())
}

/// Affiche chaque étape ; les nœuds en erreur ou sans sortie sont omis
async fn run_playbook<W, F>(playbook: &Playbook, fleet: &mut Fleet, out: &mut W, render: F) -> Result<()>
where
    W: Write,
    F: Fn(&str) -> String,
{
    let steps = playbook.run(fleet, None).await?;
    for step in &steps {
        writeln!(out, "\n--- {} ---", step.command)?;
        for (id, outcome) in step.outcomes.iter().filter(|(_, o)| !o.is_error()) {
            match outcome.output() {
                Some(text) if !text.is_empty() => writeln!(out, "{id}: {}", render(text))?,
                _ => {}
            }
        }
    }
    Ok(())
}

/// Résumé périodique jusqu'à `shutdown`. Le poll en cours est lui aussi mis
/// en course avec `shutdown` : l'abandonner annule les commandes en vol.
async fn monitor_live<W, S>(fleet: &mut Fleet, config: &FleetConfig, out: &mut W, shutdown: S) -> Result<()>
where
    W: Write,
    S: Future<Output = ()>,
{
    let collector = TelemetryCollector::new(config.telemetry.clone());
    let mut ticker = tokio::time::interval(Duration::from_secs(config.monitor.interval_secs));
    tokio::pin!(shutdown);
    writeln!(out, "Starting live fleet monitoring... (Ctrl+C to stop)")?;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }
        tokio::select! {
            polled = collector.poll(fleet, None) => {
                if let Err(e) = polled {
                    warn!(error = %e, "live poll failed");
                }
            }
            _ = &mut shutdown => break,
        }

        let totals = totals(fleet.registry());
        let line = match averages(fleet.registry()) {
            Ok(avg) => format!(
                "Online: {}/{} | Avg Temp: {:.1}°C | Avg Util: {:.1}%",
                totals.online_nodes, totals.total_nodes, avg.avg_gpu_temp, avg.avg_gpu_util
            ),
            Err(_) => format!("Online: 0/{} | no online nodes", totals.total_nodes),
        };
        writeln!(out, "{line}")?;
        writeln!(out, "Current Earnings: ${:.2}", totals.total_earnings)?;
        out.flush()?;
    }
    writeln!(out, "\nLive monitoring stopped")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use symbion_devkit::{FleetHarness, MockReply, TelemetrySample};

    async fn run_to_string(harness: &FleetHarness, command: Command) -> (Result<()>, String) {
        let mut fleet = harness.fleet().unwrap();
        let mut out = Vec::new();
        let result = run(command, &mut fleet, &harness.config, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_exec_prints_per_node_errors_and_succeeds() {
        let harness = FleetHarness::new(2);
        harness.transport.refuse("n2", "Connection refused");
        harness.transport.respond_all("echo hi", MockReply::stdout("hi\n"));

        let (result, text) = run_to_string(&harness, Command::Exec { command: "echo hi".into(), nodes: None }).await;
        assert!(result.is_ok());
        assert!(text.contains("=== n1 ===\nhi\n"));
        assert!(text.contains("=== n2 ===\nERROR: Not connected\n"));
        assert_eq!(harness.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_a_request_error() {
        let harness = FleetHarness::new(2);
        let command = Command::Exec { command: "uptime".into(), nodes: Some(vec!["n5".into()]) };

        let (result, _) = run_to_string(&harness, command).await;
        assert!(result.unwrap_err().to_string().contains("unknown node id: n5"));
        // sessions closed even on error
        assert_eq!(harness.transport.close_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_workload_is_a_request_error() {
        let harness = FleetHarness::new(2);
        let command = Command::Deploy { workload: "folding".into(), replicas: 10, nodes: None };

        let (result, _) = run_to_string(&harness, command).await;
        assert!(result.is_err());
        assert!(harness.transport.executed().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_reports_steps() {
        let harness = FleetHarness::new(4);
        let command = Command::Deploy { workload: "crypto-mining".into(), replicas: 3, nodes: None };

        let (result, text) = run_to_string(&harness, command).await;
        assert!(result.is_ok());
        assert!(text.starts_with("Deploying crypto-mining across 3 nodes"));
        assert!(text.contains("3/3 nodes ok"));
        assert!(text.contains("crypto-mining running on 3/3 nodes"));
    }

    #[tokio::test]
    async fn test_status_detailed() {
        let harness = FleetHarness::new(2);
        harness.transport.refuse("n2", "No route to host");
        harness.script_telemetry("n1", &TelemetrySample::default().gpu(64.0, 90.0));

        let (result, text) = run_to_string(&harness, Command::Status { detailed: true }).await;
        assert!(result.is_ok());
        assert!(text.contains("  Online Nodes: 1\n"));
        assert!(text.contains("  Average GPU Temp: 64.0°C\n"));
        assert!(text.contains("  n1: online - idle\n    GPU: 64°C, 90%\n"));
        assert!(text.contains("  n2: offline - idle\n"));
        assert!(text.contains("Total Fleet Earnings: $0.00"));
    }

    #[tokio::test]
    async fn test_status_without_online_nodes() {
        let harness = FleetHarness::new(2);
        harness.transport.refuse("n1", "timeout").refuse("n2", "timeout");

        let (result, text) = run_to_string(&harness, Command::Status { detailed: false }).await;
        assert!(result.is_ok());
        assert!(text.contains("  Averages: n/a (no online nodes"));
    }

    #[tokio::test]
    async fn test_connect_lists_every_node() {
        let harness = FleetHarness::new(3);
        harness.transport.refuse("n3", "Permission denied (publickey)");

        let (result, text) = run_to_string(&harness, Command::Connect).await;
        assert!(result.is_ok());
        assert!(text.contains("  n1: connected\n"));
        assert!(text.contains("  n3: FAILED (connect failed: Permission denied (publickey))\n"));
        assert!(text.contains("Connected to 2/3 nodes"));
    }

    #[tokio::test]
    async fn test_docker_status_skips_failed_nodes() {
        let harness = FleetHarness::new(2);
        harness.transport.refuse("n2", "Connection refused");
        harness.transport.respond_all("docker system df", MockReply::stdout("TYPE TOTAL\nImages 3"));

        let (result, text) = run_to_string(&harness, Command::DockerStatus).await;
        assert!(result.is_ok());
        assert!(text.contains("--- docker system df ---\nn1: TYPE TOTAL\nImages 3\n"));
        assert!(!text.contains("n2:"));
    }

    #[tokio::test]
    async fn test_nvidia_smi_default_query() {
        let harness = FleetHarness::new(1);
        let (result, _) = run_to_string(&harness, Command::NvidiaSmi { query: None }).await;
        assert!(result.is_ok());
        assert_eq!(
            harness.transport.executed_on("n1"),
            vec![format!("nvidia-smi {DEFAULT_NVIDIA_QUERY}")]
        );
    }

    #[tokio::test]
    async fn test_k8s_deploy_configures_first_node() {
        let harness = FleetHarness::new(3);
        let (result, text) = run_to_string(&harness, Command::K8sDeploy).await;
        assert!(result.is_ok());
        assert!(text.contains("--- kubectl apply -f - << 'EOL' ---\n  1/1 nodes ok\n"));
        assert!(text.ends_with("Kubernetes GPU cluster deployed\n"));
        assert_eq!(harness.transport.executed_on("n1").len(), 3);
        assert_eq!(harness.transport.executed_on("n2").len(), 1);
    }

    #[tokio::test]
    async fn test_optimize_reports_sudo_failures() {
        let harness = FleetHarness::new(2);
        harness
            .transport
            .respond("n2", "sudo ufw enable", MockReply::Stderr("ERROR: problem running ufw-init\n".into()));

        let (result, text) = run_to_string(&harness, Command::Optimize).await;
        assert!(result.is_ok());
        assert!(text.contains("--- sudo ufw enable ---\n  1/2 nodes ok\n  n2: ERROR: problem running ufw-init\n"));
        assert!(text.contains("--- sudo fail2ban-client start ---\n  2/2 nodes ok\n"));
    }

    #[tokio::test]
    async fn test_deploy_service_prints_failures() {
        let harness = FleetHarness::new(2);
        harness.transport.refuse("n2", "Connection refused");
        let command = Command::DeployService { service: "llm-gateway".into(), replicas: 2, nodes: None };

        let (result, text) = run_to_string(&harness, command).await;
        assert!(result.is_ok());
        assert!(text.contains("Deploy failed on n2: ERROR: Not connected"));
        assert!(!text.contains("deployed successfully"));
        assert_eq!(harness.transport.executed_on("n1").len(), 1);
    }

    #[tokio::test]
    async fn test_live_monitor_cancels_a_stuck_poll() {
        let harness = FleetHarness::new(2).with_command_timeout(60);
        let mut fleet = harness.connected_fleet().await.unwrap();
        harness.transport.delay("n2", Duration::from_secs(30));

        let mut out = Vec::new();
        let started = std::time::Instant::now();
        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        monitor_live(&mut fleet, &harness.config, &mut out, shutdown).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Online:"));
        assert!(text.ends_with("Live monitoring stopped\n"));
        fleet.disconnect_all().await;
        assert_eq!(harness.transport.close_count(), 2);
    }

    #[tokio::test]
    async fn test_live_monitor_prints_a_summary_per_tick() {
        let harness = FleetHarness::new(1);
        harness.script_telemetry("n1", &TelemetrySample::default().gpu(58.0, 75.0));
        let mut fleet = harness.connected_fleet().await.unwrap();

        let mut out = Vec::new();
        let shutdown = tokio::time::sleep(Duration::from_millis(300));
        monitor_live(&mut fleet, &harness.config, &mut out, shutdown).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Online: 1/1 | Avg Temp: 58.0°C | Avg Util: 75.0%\n"));
        assert!(text.contains("Current Earnings: $0.00"));
    }
}
