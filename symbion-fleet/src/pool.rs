/**
 * CONNECTION POOL - Une session shell distante par nœud
 *
 * RÔLE : Ouverture parallèle des sessions, éviction, fermeture globale.
 * Seul propriétaire des handles de session ; seul (avec la télémétrie) à
 * changer le statut des nœuds.
 *
 * INVARIANT : `status == online` <=> une session vivante existe pour l'id.
 */

use crate::credentials::CredentialStore;
use crate::dispatcher::join_ordered;
use crate::models::{NodeId, NodeStatus};
use crate::registry::NodeRegistry;
use crate::transport::{NodeTarget, Session, Transport, TransportError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ConnectResult {
    Ok,
    Failed { reason: String },
}

impl ConnectResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ConnectResult::Ok)
    }
}

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    port: u16,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    sessions: HashMap<NodeId, Arc<dyn Session>>,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        port: u16,
        connect_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            transport,
            credentials,
            port,
            connect_timeout,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            sessions: HashMap::new(),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.get(node_id).cloned()
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.sessions.contains_key(node_id)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    /// Authentifie chaque nœud du registre en parallèle. Les nœuds déjà
    /// connectés sont laissés tels quels (pas de reconnexion, pas de flapping).
    pub async fn connect_all(&mut self, registry: &mut NodeRegistry) -> BTreeMap<NodeId, ConnectResult> {
        let mut results = BTreeMap::new();
        let mut attempts: Vec<NodeTarget> = Vec::new();
        let mut missing: Vec<NodeId> = Vec::new();

        for node in registry.all() {
            if self.sessions.contains_key(&node.id) {
                results.insert(node.id.clone(), ConnectResult::Ok);
                continue;
            }
            match self.credentials.credential_for(&node.id) {
                Some(credential) => attempts.push(NodeTarget {
                    node_id: node.id.clone(),
                    address: node.address.clone(),
                    port: self.port,
                    credential,
                }),
                None => missing.push(node.id.clone()),
            }
        }

        for id in missing {
            warn!(node = %id, "no credential for node");
            set_status(registry, &id, NodeStatus::Offline, None);
            results.insert(id, ConnectResult::Failed { reason: "no credential for node".to_string() });
        }

        let timeout = self.connect_timeout;
        let tasks = attempts
            .iter()
            .map(|target| {
                let transport = Arc::clone(&self.transport);
                let target = target.clone();
                async move {
                    match tokio::time::timeout(timeout, transport.connect(&target)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Connect(format!(
                            "timed out after {}s",
                            timeout.as_secs()
                        ))),
                    }
                }
            })
            .collect();
        let slots = join_ordered(Arc::clone(&self.permits), tasks).await;

        // point de jointure passé : fusion dans le registre
        let now = Utc::now();
        for (target, slot) in attempts.into_iter().zip(slots) {
            let id = target.node_id;
            let result = match slot {
                Ok(Ok(session)) => {
                    self.sessions.insert(id.clone(), session);
                    set_status(registry, &id, NodeStatus::Online, Some(now));
                    info!(node = %id, "connected");
                    ConnectResult::Ok
                }
                Ok(Err(e)) => {
                    warn!(node = %id, error = %e, "failed to connect");
                    ConnectResult::Failed { reason: e.to_string() }
                }
                Err(reason) => ConnectResult::Failed { reason },
            };
            if !result.is_ok() {
                set_status(registry, &id, NodeStatus::Offline, None);
            }
            results.insert(id, result);
        }

        info!(
            online = self.sessions.len(),
            total = registry.len(),
            "fleet connect finished"
        );
        results
    }

    /// Retire et ferme la session d'un nœud en échec transport ; statut `error`
    pub async fn evict(&mut self, node_id: &str, registry: &mut NodeRegistry) {
        if let Some(session) = self.sessions.remove(node_id) {
            if let Err(e) = session.close().await {
                warn!(node = node_id, error = %e, "close after eviction failed");
            }
            warn!(node = node_id, "connection evicted");
        }
        set_status(registry, node_id, NodeStatus::Error, None);
    }

    /// Ferme toutes les sessions ; idempotent
    pub async fn disconnect_all(&mut self, registry: &mut NodeRegistry) {
        let drained: Vec<(NodeId, Arc<dyn Session>)> = self.sessions.drain().collect();
        if drained.is_empty() {
            return;
        }

        let tasks = drained
            .iter()
            .map(|(_, session)| {
                let session = Arc::clone(session);
                async move { session.close().await }
            })
            .collect();
        let slots = join_ordered(Arc::clone(&self.permits), tasks).await;

        for ((id, _), slot) in drained.into_iter().zip(slots) {
            if let Ok(Err(e)) = slot {
                warn!(node = %id, error = %e, "close failed");
            }
            set_status(registry, &id, NodeStatus::Offline, None);
        }
        info!("fleet disconnected");
    }
}

fn set_status(
    registry: &mut NodeRegistry,
    id: &str,
    status: NodeStatus,
    contact: Option<chrono::DateTime<Utc>>,
) {
    // les ids viennent du registre lui-même
    let _ = registry.update(id, |node| {
        node.status = status;
        if let Some(at) = contact {
            node.last_contact = Some(at);
        }
    });
}
