//! Remote-shell transport seam
//!
//! The pool only sees these traits:
//! - `Transport` authenticates to a node and hands back a live `Session`
//! - `Session` runs one line-oriented shell command and captures its output
//!
//! `SshTransport` is the production implementation; tests plug in the
//! devkit's in-memory transport.

mod ssh;

pub use ssh::SshTransport;

use crate::credentials::Credential;
use crate::models::NodeId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Exec(String),

    #[error("close failed: {0}")]
    Close(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to open a session to one node
#[derive(Debug, Clone)]
pub struct NodeTarget {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub credential: Credential,
}

/// Captured output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// stdout, or stderr when stdout is empty
    pub fn text(&self) -> &str {
        let stdout = self.stdout.trim_end();
        if stdout.is_empty() {
            self.stderr.trim_end()
        } else {
            stdout
        }
    }
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Closing twice must be harmless
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn Session>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_falls_back_to_stderr() {
        let out = CommandOutput {
            stdout: "hi\n".into(),
            stderr: "warn".into(),
            exit_code: Some(0),
        };
        assert_eq!(out.text(), "hi");

        let out = CommandOutput {
            stdout: "  \n".into(),
            stderr: "bash: nvidia-smi: command not found\n".into(),
            exit_code: Some(127),
        };
        assert_eq!(out.text(), "bash: nvidia-smi: command not found");
    }
}
