//! Named diagnostic and provisioning sequences run across the fleet
//!
//! Same step discipline as workloads: each command is fanned out to its
//! target set and fully joined before the next one starts. A step either
//! covers the whole run target set or only its first node (the cluster
//! master for `k8s-deploy`).

use crate::error::Result;
use crate::fleet::Fleet;
use crate::models::NodeId;
use crate::workload::StepReport;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTargets {
    All,
    /// First node of the run target set
    Primary,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybookStep {
    pub command: &'static str,
    pub targets: StepTargets,
}

const fn all(command: &'static str) -> PlaybookStep {
    PlaybookStep { command, targets: StepTargets::All }
}

const fn primary(command: &'static str) -> PlaybookStep {
    PlaybookStep { command, targets: StepTargets::Primary }
}

#[derive(Debug, Clone, Copy)]
pub struct Playbook {
    pub name: &'static str,
    pub steps: &'static [PlaybookStep],
    /// Prepended to every command, e.g. `sudo `
    pub prefix: &'static str,
}

pub const PERFORMANCE_MONITORING: Playbook = Playbook {
    name: "performance-monitoring",
    steps: &[
        all("top -b -n 1 | head -20"),
        all("iotop -b -n 1 | head -10"),
        all("nethogs -c 3 -t"),
        all("nvidia-smi dmon -s pucvmet -c 1"),
    ],
    prefix: "",
};

pub const DOCKER_STATUS: Playbook = Playbook {
    name: "docker-status",
    steps: &[
        all("docker ps --format \"table {{.Names}}\\t{{.Status}}\\t{{.Ports}}\""),
        all("docker stats --no-stream --format \"table {{.Container}}\\t{{.CPUPerc}}\\t{{.MemUsage}}\""),
        all("docker system df"),
    ],
    prefix: "",
};

pub const NVIDIA_DIAGNOSTICS: Playbook = Playbook {
    name: "nvidia-diagnostics",
    steps: &[
        all("nvidia-smi -L"),
        all("nvidia-settings -q GPUCurrentClockFreqs"),
        all("nvidia-settings -q GPUPowerMizerMode"),
    ],
    prefix: "",
};

/// k3s on every node, then the GPU plugin and quota from the master only
pub const K8S_GPU_CLUSTER: Playbook = Playbook {
    name: "k8s-gpu-cluster",
    steps: &[
        all("curl -sfL https://get.k3s.io | sh -"),
        primary("kubectl apply -f https://raw.githubusercontent.com/NVIDIA/k8s-device-plugin/v0.14.0/nvidia-device-plugin.yml"),
        primary(
            "kubectl apply -f - << 'EOL'
apiVersion: v1
kind: ResourceQuota
metadata:
  name: gpu-quota
spec:
  hard:
    requests.nvidia.com/gpu: \"28\"
    limits.nvidia.com/gpu: \"28\"
EOL",
        ),
    ],
    prefix: "",
};

/// System, GPU, docker and security tuning, run as root
pub const BEST_PRACTICES: Playbook = Playbook {
    name: "best-practices",
    steps: &[
        all("echo \"vm.swappiness=10\" >> /etc/sysctl.conf"),
        all("echo \"net.core.rmem_max=134217728\" >> /etc/sysctl.conf"),
        all("nvidia-smi -pm 1"),
        all("nvidia-smi -acp 0"),
        all("echo '{\"default-runtime\": \"nvidia\"}' > /etc/docker/daemon.json"),
        all("systemctl restart docker"),
        all("ufw enable"),
        all("fail2ban-client start"),
        all("systemctl enable nvidia-persistenced"),
        all("systemctl start nvidia-persistenced"),
    ],
    prefix: "sudo ",
};

impl Playbook {
    /// Commands as sent to the nodes, prefix included
    pub fn commands(&self) -> Vec<String> {
        self.steps.iter().map(|step| format!("{}{}", self.prefix, step.command)).collect()
    }

    pub async fn run(&self, fleet: &mut Fleet, node_ids: Option<&[NodeId]>) -> Result<Vec<StepReport>> {
        let targets = fleet.registry().resolve(node_ids)?;
        info!(playbook = self.name, targets = targets.len(), "running playbook");

        let mut reports = Vec::with_capacity(self.steps.len());
        for (step, command) in self.steps.iter().zip(self.commands()) {
            let step_targets = match step.targets {
                StepTargets::All => &targets[..],
                StepTargets::Primary => &targets[..targets.len().min(1)],
            };
            let outcomes = fleet.execute_on(&command, step_targets).await;
            reports.push(StepReport::new(&command, outcomes));
        }
        Ok(reports)
    }
}

/// First `lines` lines of an output joined with ` | `
pub fn condensed(text: &str, lines: usize) -> String {
    text.lines().take(lines).collect::<Vec<_>>().join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condensed() {
        assert_eq!(condensed("a\nb\nc\nd", 3), "a | b | c");
        assert_eq!(condensed("single", 3), "single");
        assert_eq!(condensed("", 3), "");
    }

    #[test]
    fn test_docker_format_is_literal() {
        assert!(DOCKER_STATUS.steps[0].command.contains("{{.Names}}\\t{{.Status}}"));
    }

    #[test]
    fn test_prefix_applies_to_every_command() {
        let commands = BEST_PRACTICES.commands();
        assert_eq!(commands.len(), 10);
        assert!(commands.iter().all(|c| c.starts_with("sudo ")));
        assert_eq!(commands[2], "sudo nvidia-smi -pm 1");
        assert_eq!(DOCKER_STATUS.commands()[2], "docker system df");
    }

    #[test]
    fn test_k8s_installs_everywhere_then_configures_master() {
        assert_eq!(K8S_GPU_CLUSTER.steps[0].targets, StepTargets::All);
        assert!(K8S_GPU_CLUSTER.steps[1..].iter().all(|s| s.targets == StepTargets::Primary));
        assert!(K8S_GPU_CLUSTER.steps[2].command.ends_with("\nEOL"));
    }
}
