//! # Remote Execution Environments
//!
//! An execution environment is a private scratch directory on some machine
//! plus the ability to run commands inside it. The per-unit procedure only
//! ever talks to the [`ExecEnv`] trait, so the same code drives a local
//! subprocess or a process on a remote host reached over SSH.
//!
//! ## Backends
//!
//! - **Local** ([`local::LocalEnv`]): temp directory on this machine, plain
//!   subprocesses
//! - **SSH** ([`ssh::SshEnv`]): `mktemp -d` on the remote host, SFTP for
//!   staging, one SSH session per command
//!
//! Staging or dial failures surface as errors; there is no retry at this
//! layer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod local;
pub mod ssh;

pub use local::LocalEnv;
pub use ssh::SshEnv;

/// Destination for a command's stdout or stderr.
pub type OutputSink = Box<dyn Write + Send>;

/// Sink that forwards to this process' stdout.
pub fn stdout_sink() -> OutputSink {
    Box::new(std::io::stdout())
}

/// Sink that forwards to this process' stderr.
pub fn stderr_sink() -> OutputSink {
    Box::new(std::io::stderr())
}

/// How to reach a worker machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionConfig {
    /// Run in a temp directory on the coordinator's own machine
    Local,
    /// Run on a remote host over SSH
    Ssh {
        /// `host:port` to dial
        addr: String,
        user: String,
        /// Private key used for public-key authentication
        key_file: PathBuf,
        /// Known-hosts store; defaults to `~/.ssh/known_hosts`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        known_hosts: Option<PathBuf>,
    },
}

impl ExecutionConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            ExecutionConfig::Local => "local",
            ExecutionConfig::Ssh { .. } => "ssh",
        }
    }

    /// Open a fresh environment for this machine.
    pub async fn connect(&self) -> Result<Box<dyn ExecEnv>> {
        match self {
            ExecutionConfig::Local => Ok(Box::new(LocalEnv::new()?)),
            ExecutionConfig::Ssh {
                addr,
                user,
                key_file,
                known_hosts,
            } => {
                let env = SshEnv::connect(
                    addr.clone(),
                    user.clone(),
                    key_file.clone(),
                    known_hosts.clone(),
                )
                .await?;
                Ok(Box::new(env))
            }
        }
    }
}

/// A command prepared by [`ExecEnv::command`] that has not been started yet.
///
/// Running it blocks a worker thread of the runtime's blocking pool until the
/// process exits; the async caller only awaits the join handle.
pub struct PendingCommand {
    description: String,
    run: Box<dyn FnOnce() -> Result<()> + Send + 'static>,
}

impl PendingCommand {
    pub fn new(
        description: impl Into<String>,
        run: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            run: Box::new(run),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Start the command and wait for it to exit.
    ///
    /// Fails when the command could not be started or exited unsuccessfully.
    pub async fn run(self) -> Result<()> {
        let Self { description, run } = self;
        tokio::task::spawn_blocking(run)
            .await
            .with_context(|| format!("command task panicked: {}", description))?
    }
}

/// Stage files and run commands inside a private scratch directory.
#[async_trait]
pub trait ExecEnv: Send + Sync {
    /// Write `data` to `name` inside the scratch directory.
    async fn write_file(&self, name: &str, data: Vec<u8>, mode: u32) -> Result<()>;

    /// Copy a local file into the scratch directory under `name`.
    async fn copy_file(&self, local: &Path, name: &str, mode: u32) -> Result<()> {
        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("failed to read {}", local.display()))?;
        self.write_file(name, data, mode).await
    }

    /// Prepare `cmd args...` to run with the scratch directory as working
    /// directory. Output is streamed into the given sinks; both sinks are
    /// dropped once the command has exited.
    fn command(
        &self,
        cmd: &str,
        args: &[String],
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> PendingCommand;

    /// Remove the scratch directory and release the connection.
    async fn close(&mut self) -> Result<()>;

    /// Backend name for log output
    fn name(&self) -> &'static str;

    /// Scratch directory path on the target machine
    fn work_dir(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_config_tagged_serde() {
        let cfg: ExecutionConfig = serde_json::from_str(
            r#"{"type":"ssh","addr":"10.0.0.2:22","user":"bench","key_file":"/keys/id"}"#,
        )
        .unwrap();
        assert_eq!(
            cfg,
            ExecutionConfig::Ssh {
                addr: "10.0.0.2:22".into(),
                user: "bench".into(),
                key_file: "/keys/id".into(),
                known_hosts: None,
            }
        );
        assert_eq!(cfg.backend_name(), "ssh");

        let local: ExecutionConfig = serde_json::from_str(r#"{"type":"local"}"#).unwrap();
        assert_eq!(local, ExecutionConfig::Local);
    }

    #[tokio::test]
    async fn test_pending_command_propagates_error() {
        let cmd = PendingCommand::new("fail", || Err(anyhow::anyhow!("boom")));
        assert_eq!(cmd.description(), "fail");
        let err = cmd.run().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
