/**
 * FLEET - Coordinateur unique de la flotte
 *
 * RÔLE : Possède le registre, le pool et le dispatcher. Toutes les écritures
 * dans le registre passent par ici, après le point de jointure de chaque fan-out.
 *
 * POLITIQUE : une erreur transport (ou timeout) sur un nœud évince sa session
 * et le passe en `error`. `Not connected` ne change rien.
 */

use crate::aggregator::{self, FleetSnapshot};
use crate::config::FleetConfig;
use crate::credentials::{CredentialStore, StaticKeyStore};
use crate::dispatcher::{CommandDispatcher, OutcomeMap};
use crate::error::Result;
use crate::models::NodeId;
use crate::pool::{ConnectResult, ConnectionPool};
use crate::registry::NodeRegistry;
use crate::transport::{SshTransport, Transport};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Fleet {
    registry: NodeRegistry,
    pool: ConnectionPool,
    dispatcher: CommandDispatcher,
}

impl Fleet {
    pub fn new(
        config: &FleetConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = NodeRegistry::from_layout(&config.fleet, &config.profile)?;
        let pool = ConnectionPool::new(
            transport,
            credentials,
            config.ssh.port,
            config.ssh.connect_timeout(),
            config.dispatch.max_concurrency,
        );
        let dispatcher = CommandDispatcher::new(
            config.dispatch.command_timeout(),
            config.dispatch.max_concurrency,
        );
        Ok(Self { registry, pool, dispatcher })
    }

    /// Flotte réelle : `ssh` système + clés de la config
    pub fn over_ssh(config: &FleetConfig) -> Result<Self> {
        let transport = SshTransport::new(config.ssh.control_dir(), config.ssh.connect_timeout());
        let credentials = StaticKeyStore::from_ssh_conf(&config.ssh);
        Self::new(config, Arc::new(transport), Arc::new(credentials))
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn connect_all(&mut self) -> BTreeMap<NodeId, ConnectResult> {
        self.pool.connect_all(&mut self.registry).await
    }

    pub async fn disconnect_all(&mut self) {
        self.pool.disconnect_all(&mut self.registry).await
    }

    /// Fan-out de `command` ; `node_ids = None` cible toute la flotte.
    /// Seul un id inconnu fait échouer l'appel.
    pub async fn execute(&mut self, command: &str, node_ids: Option<&[NodeId]>) -> Result<OutcomeMap> {
        let targets = self.registry.resolve(node_ids)?;
        Ok(self.execute_on(command, &targets).await)
    }

    pub(crate) async fn execute_on(&mut self, command: &str, targets: &[NodeId]) -> OutcomeMap {
        let outcomes = self.dispatcher.execute(&self.pool, targets, command).await;
        let now = Utc::now();
        for (id, outcome) in &outcomes {
            match outcome.error() {
                None => {
                    let _ = self.registry.update(id, |node| node.last_contact = Some(now));
                }
                Some(e) if e.is_transport() => self.pool.evict(id, &mut self.registry).await,
                Some(_) => {}
            }
        }
        outcomes
    }

    pub fn snapshot(&self) -> Result<FleetSnapshot> {
        aggregator::summarize(&self.registry)
    }
}
