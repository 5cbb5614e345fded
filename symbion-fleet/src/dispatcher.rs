/**
 * COMMAND DISPATCHER - Fan-out d'une commande shell sur un sous-ensemble de nœuds
 *
 * RÔLE : Une tâche par nœud, toutes lancées en parallèle, jointure unique,
 * puis une carte complète id -> résultat. Jamais d'échec global parce qu'un
 * nœud a échoué : l'appelant inspecte chaque résultat.
 *
 * ARCHITECTURE : JoinSet borné par sémaphore, chaque tâche écrit dans son slot
 * (arena + index). Abandonner le futur abandonne le JoinSet donc toutes les
 * tâches en vol. Pas de retry, pas d'annulation entre voisins.
 */

use crate::models::NodeId;
use crate::pool::ConnectionPool;
use crate::transport::Session;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-node failure, rendered as `ERROR: <text>` in an outcome
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("Not connected")]
    NotConnected,

    #[error("Timeout after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Transport(String),

    #[error("task aborted: {0}")]
    Aborted(String),
}

impl NodeError {
    /// Transport-level failures break the session
    pub fn is_transport(&self) -> bool {
        matches!(self, NodeError::Timeout(_) | NodeError::Transport(_) | NodeError::Aborted(_))
    }
}

/// Prefix of every failed outcome once rendered
pub const ERROR_PREFIX: &str = "ERROR:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Output(String),
    Failed(NodeError),
}

impl Outcome {
    /// Judged on the rendered text: remote output that itself starts with
    /// `ERROR:` counts as a failure, like a local one.
    pub fn is_error(&self) -> bool {
        match self {
            Outcome::Output(text) => text.starts_with(ERROR_PREFIX),
            Outcome::Failed(_) => true,
        }
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            Outcome::Output(text) => Some(text),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&NodeError> {
        match self {
            Outcome::Output(_) => None,
            Outcome::Failed(e) => Some(e),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Output(text) => f.write_str(text),
            Outcome::Failed(e) => write!(f, "{ERROR_PREFIX} {e}"),
        }
    }
}

pub type OutcomeMap = BTreeMap<NodeId, Outcome>;

/// Count of outcomes that are not errors
pub fn success_count(outcomes: &OutcomeMap) -> usize {
    outcomes.values().filter(|o| !o.is_error()).count()
}

pub struct CommandDispatcher {
    command_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl CommandDispatcher {
    pub fn new(command_timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            command_timeout,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Exécute `command` sur chaque cible (ids déjà validés par l'appelant)
    pub async fn execute(&self, pool: &ConnectionPool, targets: &[NodeId], command: &str) -> OutcomeMap {
        let command_id = Uuid::new_v4();
        info!(%command_id, targets = targets.len(), command, "dispatching fleet command");

        let mut outcomes = OutcomeMap::new();
        let mut pending: Vec<(NodeId, Arc<dyn Session>)> = Vec::with_capacity(targets.len());
        for id in targets {
            match pool.get(id) {
                Some(session) => pending.push((id.clone(), session)),
                None => {
                    outcomes.insert(id.clone(), Outcome::Failed(NodeError::NotConnected));
                }
            }
        }

        let timeout = self.command_timeout;
        let tasks = pending
            .iter()
            .map(|(id, session)| {
                let session = Arc::clone(session);
                let command = command.to_string();
                let node = id.clone();
                async move {
                    match tokio::time::timeout(timeout, session.exec(&command)).await {
                        Ok(Ok(output)) => Outcome::Output(output.text().to_string()),
                        Ok(Err(e)) => {
                            debug!(%node, error = %e, "command transport failure");
                            Outcome::Failed(NodeError::Transport(e.to_string()))
                        }
                        Err(_) => Outcome::Failed(NodeError::Timeout(timeout)),
                    }
                }
            })
            .collect();

        let slots = join_ordered(Arc::clone(&self.permits), tasks).await;
        for ((id, _), slot) in pending.into_iter().zip(slots) {
            let outcome = slot.unwrap_or_else(|reason| Outcome::Failed(NodeError::Aborted(reason)));
            outcomes.insert(id, outcome);
        }

        let ok = success_count(&outcomes);
        info!(%command_id, ok, failed = outcomes.len() - ok, "fleet command completed");
        outcomes
    }
}

/// Lance chaque futur dans sa propre tâche et rend les résultats dans l'ordre
/// d'entrée. Un slot en `Err` correspond à une tâche paniquée ou annulée.
pub(crate) async fn join_ordered<F, R>(permits: Arc<Semaphore>, tasks: Vec<F>) -> Vec<Result<R, String>>
where
    F: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let mut slots: Vec<Result<R, String>> =
        (0..tasks.len()).map(|_| Err("task did not complete".to_string())).collect();

    let mut set = JoinSet::new();
    for (slot, task) in tasks.into_iter().enumerate() {
        let permits = Arc::clone(&permits);
        set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (slot, task.await)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((slot, value)) => slots[slot] = Ok(value),
            Err(e) => warn!(error = %e, "fan-out task failed to join"),
        }
    }
    slots
}
