//! Local execution backend: a private temp directory on this machine.

use super::{ExecEnv, OutputSink, PendingCommand};
use crate::error::check_status;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::debug;

pub struct LocalEnv {
    dir: Option<TempDir>,
    path: PathBuf,
    display: String,
}

impl LocalEnv {
    /// Allocate a fresh scratch directory under the system temp directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(crate::defaults::SCRATCH_PREFIX)
            .tempdir()
            .context("failed to create local scratch directory")?;
        let path = dir.path().to_path_buf();
        debug!(work_dir = %path.display(), "allocated local scratch directory");

        Ok(Self {
            display: path.display().to_string(),
            dir: Some(dir),
            path,
        })
    }

    fn resolve_program(&self, cmd: &str) -> PathBuf {
        // relative paths with a separator refer to files staged in the scratch dir
        let program = Path::new(cmd);
        if cmd.contains('/') && program.is_relative() {
            self.path.join(program)
        } else {
            program.to_path_buf()
        }
    }
}

#[async_trait]
impl ExecEnv for LocalEnv {
    async fn write_file(&self, name: &str, data: Vec<u8>, mode: u32) -> Result<()> {
        let target = self.path.join(name);
        tokio::fs::write(&target, data)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        set_mode(&target, mode).await
    }

    fn command(
        &self,
        cmd: &str,
        args: &[String],
        mut stdout: OutputSink,
        mut stderr: OutputSink,
    ) -> PendingCommand {
        let program = self.resolve_program(cmd);
        let work_dir = self.path.clone();
        let args = args.to_vec();
        let description = format!("{} {}", cmd, args.join(" "));

        PendingCommand::new(description, move || {
            let mut child = Command::new(&program)
                .args(&args)
                .current_dir(&work_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("failed to spawn {}", program.display()))?;

            let child_stderr = child.stderr.take();
            let stderr_copy = std::thread::spawn(move || {
                if let Some(mut pipe) = child_stderr {
                    let _ = std::io::copy(&mut pipe, &mut stderr);
                }
            });

            // the pipe is dropped right after copying; a child still writing
            // then fails with EPIPE instead of blocking the wait below
            let forwarded = match child.stdout.take() {
                Some(mut pipe) => std::io::copy(&mut pipe, &mut stdout)
                    .map(drop)
                    .context("failed to forward stdout"),
                None => Ok(()),
            };
            drop(stdout);

            let status = child.wait().context("failed to wait for child")?;
            let _ = stderr_copy.join();
            forwarded?;
            check_status(status)
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            debug!(work_dir = %self.display, "removing local scratch directory");
            dir.close().context("failed to remove local scratch directory")?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn work_dir(&self) -> &str {
        &self.display
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
