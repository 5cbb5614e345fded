/*!
Mock SSH transport pour développement sans vraie flotte

Permet de tester le pool, le dispatcher et la télémétrie sans aucun nœud réel.
Chaque nœud peut refuser la connexion, répondre à des commandes scriptées,
échouer au niveau transport ou répondre avec du retard. Toutes les commandes
exécutées sont enregistrées pour les assertions.
*/

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use symbion_fleet::transport::{CommandOutput, NodeTarget, Session, Transport, TransportError};

/// Réponse scriptée d'un nœud à une commande
#[derive(Debug, Clone)]
pub enum MockReply {
    Stdout(String),
    Stderr(String),
    TransportError(String),
}

impl MockReply {
    pub fn stdout(text: impl Into<String>) -> Self {
        MockReply::Stdout(text.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockExec {
    pub node_id: String,
    pub command: String,
}

#[derive(Default)]
struct MockState {
    refused: HashMap<String, String>,
    replies: HashMap<(String, String), MockReply>,
    fleet_replies: HashMap<String, MockReply>,
    broken: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    executed: Vec<MockExec>,
    targets: Vec<NodeTarget>,
    connects: usize,
    closes: usize,
}

/// Transport en mémoire, clonable (état partagé)
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Le nœud refuse l'authentification
    pub fn refuse(&self, node_id: &str, reason: &str) -> &Self {
        self.state.lock().unwrap().refused.insert(node_id.to_string(), reason.to_string());
        self
    }

    /// Réponse d'un nœud précis à une commande exacte
    pub fn respond(&self, node_id: &str, command: &str, reply: MockReply) -> &Self {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert((node_id.to_string(), command.to_string()), reply);
        self
    }

    /// Réponse de tous les nœuds à une commande exacte
    pub fn respond_all(&self, command: &str, reply: MockReply) -> &Self {
        self.state.lock().unwrap().fleet_replies.insert(command.to_string(), reply);
        self
    }

    /// Toute commande sur ce nœud échoue au niveau transport
    pub fn break_session(&self, node_id: &str, reason: &str) -> &Self {
        self.state.lock().unwrap().broken.insert(node_id.to_string(), reason.to_string());
        self
    }

    pub fn delay(&self, node_id: &str, delay: Duration) -> &Self {
        self.state.lock().unwrap().delays.insert(node_id.to_string(), delay);
        self
    }

    pub fn executed(&self) -> Vec<MockExec> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn executed_on(&self, node_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|e| e.node_id == node_id)
            .map(|e| e.command.clone())
            .collect()
    }

    /// Cibles reçues par `connect` (pour vérifier adresses et clés)
    pub fn connect_targets(&self) -> Vec<NodeTarget> {
        self.state.lock().unwrap().targets.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock().unwrap();
        state.executed.clear();
        state.targets.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn Session>, TransportError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.targets.push(target.clone());
            if let Some(reason) = state.refused.get(&target.node_id) {
                log::info!("🚫 [MOCK] {} refused connection", target.node_id);
                return Err(TransportError::Connect(reason.clone()));
            }
            state.connects += 1;
            state.delays.get(&target.node_id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        log::info!("🔌 [MOCK] connected to {}", target.node_id);
        Ok(Arc::new(MockSession {
            node_id: target.node_id.clone(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    node_id: String,
    state: Arc<Mutex<MockState>>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for MockSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Exec("session closed".to_string()));
        }

        let (reply, delay) = {
            let mut state = self.state.lock().unwrap();
            state.executed.push(MockExec {
                node_id: self.node_id.clone(),
                command: command.to_string(),
            });
            let reply = match state.broken.get(&self.node_id) {
                Some(reason) => Some(MockReply::TransportError(reason.clone())),
                None => state
                    .replies
                    .get(&(self.node_id.clone(), command.to_string()))
                    .or_else(|| state.fleet_replies.get(command))
                    .cloned(),
            };
            (reply, state.delays.get(&self.node_id).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        log::debug!("📤 [MOCK] {} <- {}", self.node_id, command);
        match reply {
            Some(MockReply::Stdout(stdout)) => Ok(CommandOutput { stdout, stderr: String::new(), exit_code: Some(0) }),
            Some(MockReply::Stderr(stderr)) => Ok(CommandOutput { stdout: String::new(), stderr, exit_code: Some(1) }),
            Some(MockReply::TransportError(reason)) => Err(TransportError::Exec(reason)),
            None => Ok(CommandOutput { exit_code: Some(0), ..Default::default() }),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().unwrap().closes += 1;
        }
        Ok(())
    }
}
