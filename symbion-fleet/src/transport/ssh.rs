//! SSH transport over the system `ssh` client
//!
//! - connect: authenticates once (`true` over a new master) and leaves a
//!   persistent ControlMaster socket per node
//! - exec: runs the command through that socket (no new handshake)
//! - close: `ssh -O exit` tears the master down
//!
//! Exit status 255 is ssh's own failure code and maps to a transport error;
//! any other status belongs to the remote command.

use super::{CommandOutput, NodeTarget, Session, Transport, TransportError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

const SSH_FAILURE: i32 = 255;

pub struct SshTransport {
    program: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(control_dir: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            control_dir: control_dir.into(),
            connect_timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn control_path(&self, node_id: &str) -> PathBuf {
        self.control_dir.join(format!("{node_id}.sock"))
    }

    /// Arguments opening a background master for `target`
    pub fn master_args(&self, target: &NodeTarget) -> Vec<String> {
        let control = self.control_path(&target.node_id);
        vec![
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            target.port.to_string(),
            "-i".to_string(),
            target.credential.private_key.display().to_string(),
            destination(target),
            // la session se termine, le master persiste en arrière-plan
            "true".to_string(),
        ]
    }
}

fn destination(target: &NodeTarget) -> String {
    format!("{}@{}", target.credential.user, target.address)
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn Session>, TransportError> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        debug!(node = %target.node_id, address = %target.address, "opening ssh master");

        let output = AsyncCommand::new(&self.program)
            .args(self.master_args(target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TransportError::Connect(if stderr.is_empty() {
                format!("ssh exited with {}", output.status)
            } else {
                stderr
            }));
        }

        Ok(Arc::new(SshSession {
            program: self.program.clone(),
            control_path: self.control_path(&target.node_id),
            destination: destination(target),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct SshSession {
    program: String,
    control_path: PathBuf,
    destination: String,
    closed: AtomicBool,
}

impl SshSession {
    fn base_command(&self, control_path: &Path) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg("BatchMode=yes")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Exec("session closed".to_string()));
        }

        let output = self
            .base_command(&self.control_path)
            .arg(&self.destination)
            .arg(command)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        if exit_code == Some(SSH_FAILURE) || exit_code.is_none() {
            let reason = stderr.trim();
            return Err(TransportError::Exec(if reason.is_empty() {
                format!("ssh exited with {}", output.status)
            } else {
                reason.to_string()
            }));
        }

        Ok(CommandOutput { stdout, stderr, exit_code })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let output = self
            .base_command(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Close(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}
