/**
 * WORKLOAD DISTRIBUTOR - Déploiement d'un workload nommé sur un sous-ensemble
 *
 * RÔLE : workload type -> séquence fixe de commandes, exécutée étape par étape
 * sur le même ensemble de cibles (pas de court-circuit par nœud). L'étape N+1
 * démarre une fois l'étape N jointe pour tous les nœuds.
 *
 * SÉLECTION : politique nommée derrière un trait (`FirstNPolicy` par défaut),
 * remplaçable sans toucher au dispatcher.
 */

use crate::dispatcher::{success_count, OutcomeMap};
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::models::NodeId;
use crate::registry::NodeRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    AiInference,
    CryptoMining,
    AkashProvider,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::AiInference,
        WorkloadKind::CryptoMining,
        WorkloadKind::AkashProvider,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WorkloadKind::AiInference => "ai-inference",
            WorkloadKind::CryptoMining => "crypto-mining",
            WorkloadKind::AkashProvider => "akash-provider",
        }
    }

    pub fn commands(&self) -> &'static [&'static str] {
        match self {
            WorkloadKind::AiInference => &[
                "docker run -d --gpus all --name ai-inference-$(hostname) -p 8080:8080 minechain/ai-inference:latest",
                "docker exec ai-inference-$(hostname) python warm_up_model.py",
            ],
            WorkloadKind::CryptoMining => &[
                "docker run -d --gpus all --name miner-$(hostname) minechain/miner:latest --algo ethash --pool stratum+tcp://pool.minechain.ai:4444",
                "docker logs miner-$(hostname) | tail -5",
            ],
            WorkloadKind::AkashProvider => &[
                "docker run -d --gpus all --name akash-provider-$(hostname) ghcr.io/akash-network/provider:latest",
                "docker exec akash-provider-$(hostname) provider status",
            ],
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkloadKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| FleetError::UnknownWorkload(s.to_string()))
    }
}

/// Chooses which nodes receive `count` instances
pub trait TargetSelection: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, registry: &NodeRegistry, count: usize) -> Vec<NodeId>;
}

/// First `count` ids in registry order, whatever their state
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstNPolicy;

impl TargetSelection for FirstNPolicy {
    fn name(&self) -> &'static str {
        "first-n"
    }

    fn select(&self, registry: &NodeRegistry, count: usize) -> Vec<NodeId> {
        registry.all().iter().take(count).map(|n| n.id.clone()).collect()
    }
}

/// One command of a sequence, fanned out to every target
#[derive(Debug, Clone)]
pub struct StepReport {
    pub command: String,
    pub success_count: usize,
    pub target_count: usize,
    pub outcomes: OutcomeMap,
}

impl StepReport {
    pub fn new(command: &str, outcomes: OutcomeMap) -> Self {
        Self {
            command: command.to_string(),
            success_count: success_count(&outcomes),
            target_count: outcomes.len(),
            outcomes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub workload: WorkloadKind,
    pub targets: Vec<NodeId>,
    pub steps: Vec<StepReport>,
    /// Nodes on which every step succeeded
    pub completed: Vec<NodeId>,
}

/// `docker pull` then `docker run` of one image, see [`WorkloadDistributor::deploy_service`]
#[derive(Debug, Clone)]
pub struct ServiceDeployment {
    pub service: String,
    pub targets: Vec<NodeId>,
    pub steps: Vec<StepReport>,
    /// Failed nodes of the step that stopped the rollout, rendered outcome
    pub failures: Vec<(NodeId, String)>,
}

impl ServiceDeployment {
    pub fn deployed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pull and run commands for `minechain/<service>:latest`
pub fn service_commands(service: &str) -> [String; 2] {
    [
        format!("docker pull minechain/{service}:latest"),
        format!("docker run -d --gpus all --name {service}-$(hostname) --restart unless-stopped minechain/{service}:latest"),
    ]
}

/// Le nom est interpolé dans une commande shell
fn validate_service_name(service: &str) -> Result<()> {
    let valid = !service.is_empty()
        && !service.starts_with(|c| c == '-' || c == '.')
        && service.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FleetError::InvalidServiceName(service.to_string()))
    }
}

pub struct WorkloadDistributor {
    policy: Box<dyn TargetSelection>,
}

impl Default for WorkloadDistributor {
    fn default() -> Self {
        Self::new(Box::new(FirstNPolicy))
    }
}

impl WorkloadDistributor {
    pub fn new(policy: Box<dyn TargetSelection>) -> Self {
        Self { policy }
    }

    pub async fn distribute(
        &self,
        fleet: &mut Fleet,
        workload_type: &str,
        instance_count: usize,
        explicit_node_ids: Option<&[NodeId]>,
    ) -> Result<DeploymentReport> {
        let workload: WorkloadKind = workload_type.parse()?;
        let targets = match explicit_node_ids {
            Some(ids) => fleet.registry().resolve(Some(ids))?,
            None => self.policy.select(fleet.registry(), instance_count),
        };
        info!(
            %workload,
            policy = self.policy.name(),
            targets = targets.len(),
            "distributing workload"
        );

        let mut steps = Vec::with_capacity(workload.commands().len());
        let mut completed: HashSet<NodeId> = targets.iter().cloned().collect();
        for command in workload.commands() {
            let outcomes = fleet.execute_on(command, &targets).await;
            for (id, outcome) in &outcomes {
                if outcome.is_error() {
                    completed.remove(id);
                }
            }
            let step = StepReport::new(command, outcomes);
            info!(%workload, ok = step.success_count, total = step.target_count, "workload step done");
            steps.push(step);
        }

        let completed: Vec<NodeId> = targets.iter().filter(|id| completed.contains(*id)).cloned().collect();
        for id in &completed {
            fleet.registry_mut().update(id, |node| node.workload = workload.name().to_string())?;
        }

        Ok(DeploymentReport { workload, targets, steps, completed })
    }

    /// Déploie une image docker arbitraire. Contrairement aux workloads, le
    /// `run` n'est pas lancé si un nœud a échoué au `pull`.
    pub async fn deploy_service(
        &self,
        fleet: &mut Fleet,
        service: &str,
        replicas: usize,
        explicit_node_ids: Option<&[NodeId]>,
    ) -> Result<ServiceDeployment> {
        validate_service_name(service)?;
        let targets = match explicit_node_ids {
            Some(ids) => fleet.registry().resolve(Some(ids))?,
            None => self.policy.select(fleet.registry(), replicas),
        };
        info!(service, targets = targets.len(), "deploying docker service");

        let mut steps = Vec::with_capacity(2);
        let mut failures = Vec::new();
        for command in service_commands(service) {
            let step = StepReport::new(&command, fleet.execute_on(&command, &targets).await);
            failures = step
                .outcomes
                .iter()
                .filter(|(_, outcome)| outcome.is_error())
                .map(|(id, outcome)| (id.clone(), outcome.to_string()))
                .collect();
            steps.push(step);
            if !failures.is_empty() {
                warn!(service, failed = failures.len(), "service rollout stopped");
                break;
            }
        }

        Ok(ServiceDeployment { service: service.to_string(), targets, steps, failures })
    }
}
