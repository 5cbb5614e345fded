/**
 * NODE REGISTRY - Catalogue statique des membres de la flotte
 *
 * RÔLE : Ids et adresses déterministes, dernier état observé de chaque nœud.
 * Peuplé une seule fois au démarrage, muté sur place ensuite, jamais réduit.
 *
 * ARCHITECTURE : Arena `Vec<Node>` indexée par position dense + index id -> slot.
 * Les tâches concurrentes n'écrivent jamais ici : le coordinateur fusionne
 * leurs résultats après le point de jointure.
 */

use crate::config::{LayoutConf, ProfileConf};
use crate::error::{FleetError, Result};
use crate::models::{CpuMetrics, MemoryMetrics, Node, NodeId, NodeStatus};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl NodeRegistry {
    /// Peuple `count` nœuds depuis les templates d'id et d'adresse (`n` commence à 1)
    pub fn initialize(
        count: usize,
        id_template: &str,
        address_template: &str,
        profile: &ProfileConf,
    ) -> Result<Self> {
        let mut registry = Self::default();
        for n in 1..=count {
            let id = render_template(id_template, n)?;
            let address = render_template(address_template, n)?;
            if registry.index.contains_key(&id) {
                return Err(FleetError::DuplicateNodeId(id));
            }
            registry.index.insert(id.clone(), registry.nodes.len());
            registry.nodes.push(Node {
                id,
                address,
                status: NodeStatus::Offline,
                gpu: None,
                cpu: CpuMetrics {
                    cores: profile.cpu_cores,
                    threads: profile.cpu_threads,
                    usage_pct: 0.0,
                    temperature_c: 0.0,
                },
                memory: MemoryMetrics {
                    total_gb: profile.memory_gb,
                    used_gb: 0.0,
                    free_gb: profile.memory_gb,
                    usage_pct: 0.0,
                },
                workload: "idle".to_string(),
                earnings: 0.0,
                last_contact: None,
            });
        }
        info!(nodes = registry.nodes.len(), "fleet registry initialized");
        Ok(registry)
    }

    pub fn from_layout(layout: &LayoutConf, profile: &ProfileConf) -> Result<Self> {
        Self::initialize(layout.size, &layout.id_template, &layout.address_template, profile)
    }

    pub fn get(&self, id: &str) -> Result<&Node> {
        self.index
            .get(id)
            .map(|&slot| &self.nodes[slot])
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))
    }

    /// Tous les nœuds, dans l'ordre des ids
    pub fn all(&self) -> &[Node] {
        &self.nodes
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn update<F>(&mut self, id: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut Node),
    {
        let slot = *self
            .index
            .get(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        mutator(&mut self.nodes[slot]);
        Ok(())
    }

    /// Valide une liste explicite (ou prend tous les ids), sans doublons, ordre conservé
    pub fn resolve(&self, ids: Option<&[NodeId]>) -> Result<Vec<NodeId>> {
        let Some(ids) = ids else {
            return Ok(self.ids());
        };
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            self.get(id)?;
            if seen.insert(id.as_str()) {
                resolved.push(id.clone());
            }
        }
        Ok(resolved)
    }

    pub fn credit_earnings(&mut self, id: &str, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(FleetError::InvalidAmount(amount));
        }
        self.update(id, |node| node.earnings += amount)
    }

    /// Sauvegarde la table des nœuds en JSON
    pub async fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.nodes)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Recharge métriques, workload, gains et dernier contact des ids connus.
    /// Le statut repart à `offline` : aucune connexion ne survit au processus.
    pub async fn restore_state<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no saved fleet state");
            return Ok(0);
        }
        let content = tokio::fs::read_to_string(path).await?;
        let saved: Vec<Node> = serde_json::from_str(&content)?;

        let mut restored = 0;
        for record in saved {
            let Some(&slot) = self.index.get(&record.id) else {
                debug!(node = %record.id, "saved node not in current layout, ignored");
                continue;
            };
            let node = &mut self.nodes[slot];
            node.gpu = record.gpu;
            node.cpu = record.cpu;
            node.memory = record.memory;
            node.workload = record.workload;
            node.earnings = record.earnings;
            node.last_contact = record.last_contact;
            node.status = NodeStatus::Offline;
            restored += 1;
        }
        info!(restored, path = %path.display(), "fleet state restored");
        Ok(restored)
    }
}

/// Rend un template d'id/adresse pour l'index `n`.
/// Placeholders : `{n}`, `{n+K}`, `{n:0W}`, `{n+K:0W}`.
pub fn render_template(template: &str, n: usize) -> Result<String> {
    let invalid = |reason: &str| FleetError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::with_capacity(template.len() + 4);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
        let spec = &after[..close];

        let (expr, width) = match spec.split_once(':') {
            Some((expr, fmt)) => {
                let width: usize = fmt.parse().map_err(|_| invalid("bad pad width"))?;
                (expr, width)
            }
            None => (spec, 0),
        };
        let value = match expr.trim().strip_prefix('n') {
            Some("") => n,
            Some(offset) => {
                let k: usize = offset
                    .trim()
                    .strip_prefix('+')
                    .ok_or_else(|| invalid("expected '+K' after 'n'"))?
                    .trim()
                    .parse()
                    .map_err(|_| invalid("bad offset"))?;
                n.checked_add(k).ok_or_else(|| invalid("offset overflow"))?
            }
            None => return Err(invalid("placeholder must start with 'n'")),
        };
        out.push_str(&format!("{value:0width$}"));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
