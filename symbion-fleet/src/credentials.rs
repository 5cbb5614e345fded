//! Credential lookup for node sessions
//!
//! Keys are resolved per node id so a key can be rotated or isolated for one
//! node without touching the rest of the fleet.

use crate::config::{expand_home, SshConf};
use crate::models::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub private_key: PathBuf,
}

pub trait CredentialStore: Send + Sync {
    fn credential_for(&self, node_id: &str) -> Option<Credential>;
}

/// Shared fleet key with optional per-node overrides
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    default: Option<Credential>,
    overrides: HashMap<NodeId, Credential>,
}

impl StaticKeyStore {
    pub fn new(default: Option<Credential>) -> Self {
        Self { default, overrides: HashMap::new() }
    }

    pub fn with_override(mut self, node_id: impl Into<NodeId>, credential: Credential) -> Self {
        self.overrides.insert(node_id.into(), credential);
        self
    }

    pub fn from_ssh_conf(conf: &SshConf) -> Self {
        let default = conf.private_key.as_deref().map(|key| Credential {
            user: conf.user.clone(),
            private_key: expand_home(key),
        });
        let overrides = conf
            .keys
            .iter()
            .map(|(node_id, key)| {
                let credential = Credential {
                    user: key.user.clone().unwrap_or_else(|| conf.user.clone()),
                    private_key: expand_home(&key.private_key),
                };
                (node_id.clone(), credential)
            })
            .collect();
        Self { default, overrides }
    }
}

impl CredentialStore for StaticKeyStore {
    fn credential_for(&self, node_id: &str) -> Option<Credential> {
        self.overrides
            .get(node_id)
            .or(self.default.as_ref())
            .cloned()
    }
}
