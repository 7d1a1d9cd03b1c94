//! SSH execution backend.
//!
//! `ssh2` is a blocking library, so every interaction with the session runs
//! on tokio's blocking pool. A fresh channel is opened per command; files are
//! staged over SFTP.
//!
//! A command's stdout and stderr share the channel's flow-control window, so
//! both are read in one loop with the session switched to non-blocking mode.

use super::{ExecEnv, OutputSink, PendingCommand};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ssh2::{CheckResult, FileStat, KnownHostFileKind, OpenFlags, OpenType, Session, Sftp};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_SSH_PORT: u16 = 22;

/// Pause between polls when neither output stream has data
const IDLE_POLL: Duration = Duration::from_millis(5);

pub struct SshEnv {
    session: Session,
    addr: String,
    work_dir: String,
    closed: bool,
}

impl SshEnv {
    /// Dial `addr`, verify the host key, authenticate and create a remote
    /// scratch directory.
    pub async fn connect(
        addr: String,
        user: String,
        key_file: PathBuf,
        known_hosts: Option<PathBuf>,
    ) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            Self::connect_blocking(addr, &user, &key_file, known_hosts)
        })
        .await
        .context("ssh connect task panicked")?
    }

    fn connect_blocking(
        addr: String,
        user: &str,
        key_file: &Path,
        known_hosts: Option<PathBuf>,
    ) -> Result<Self> {
        let tcp =
            TcpStream::connect(&addr).with_context(|| format!("unable to connect to {}", addr))?;
        let mut session = Session::new().context("failed to create ssh session")?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .with_context(|| format!("ssh handshake with {} failed", addr))?;

        let known_hosts = match known_hosts {
            Some(path) => path,
            None => crate::utils::expand_home("~/.ssh/known_hosts")?,
        };
        verify_host_key(&session, &addr, &known_hosts)?;

        session
            .userauth_pubkey_file(user, None, key_file, None)
            .with_context(|| {
                format!(
                    "public key authentication as {} with {} failed",
                    user,
                    key_file.display()
                )
            })?;
        if !session.authenticated() {
            bail!("ssh authentication to {} was not accepted", addr);
        }

        let (out, status) = exec_capture(&session, "mktemp -d")?;
        if status != 0 {
            bail!("mktemp on {} exited with status {}", addr, status);
        }
        let work_dir = out.trim().to_string();
        if work_dir.is_empty() {
            bail!("mktemp on {} returned no directory", addr);
        }
        info!(%addr, %work_dir, "ssh scratch directory created");

        Ok(Self {
            session,
            addr,
            work_dir,
            closed: false,
        })
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        Path::new(&self.work_dir).join(name)
    }
}

/// Check the server's host key against a known-hosts file. Unknown hosts are
/// rejected, never added.
fn verify_host_key(session: &Session, addr: &str, known_hosts: &Path) -> Result<()> {
    let (host, port) = split_host_port(addr);
    let mut hosts = session.known_hosts().context("failed to init known hosts")?;
    hosts
        .read_file(known_hosts, KnownHostFileKind::OpenSSH)
        .with_context(|| format!("failed to read {}", known_hosts.display()))?;

    let (key, _) = session
        .host_key()
        .ok_or_else(|| anyhow!("{} did not present a host key", addr))?;

    match hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => bail!("host key for {} not found in known hosts", addr),
        CheckResult::Mismatch => bail!("host key for {} does not match known hosts", addr),
        CheckResult::Failure => bail!("failed to check host key for {}", addr),
    }
}

fn split_host_port(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (addr, DEFAULT_SSH_PORT),
        },
        None => (addr, DEFAULT_SSH_PORT),
    }
}

/// Run a one-shot command and collect its stdout.
fn exec_capture(session: &Session, cmd: &str) -> Result<(String, i32)> {
    let mut channel = session.channel_session()?;
    channel.exec(cmd)?;
    let mut out = String::new();
    channel.read_to_string(&mut out)?;
    channel.wait_close()?;
    Ok((out, channel.exit_status()?))
}

/// Build the remote shell line for `cmd args...` run inside `work_dir`.
pub fn remote_command_line(work_dir: &str, cmd: &str, args: &[String]) -> String {
    let escaped: Vec<String> = args.iter().map(|a| shellwords::escape(a)).collect();
    format!(
        "cd {} && {} {}",
        shellwords::escape(work_dir),
        cmd,
        escaped.join(" ")
    )
}

/// The SFTP operations used for staging.
trait StagingFs {
    type File: Write;

    /// Create or truncate `path`, asking for `mode` right away.
    fn create_with_mode(&self, path: &Path, mode: u32) -> Result<Self::File>;

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;
}

impl StagingFs for Sftp {
    type File = ssh2::File;

    fn create_with_mode(&self, path: &Path, mode: u32) -> Result<Self::File> {
        Ok(self.open_mode(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            mode as i32,
            OpenType::File,
        )?)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        Ok(self.setstat(path, stat)?)
    }
}

fn stage_file<F: StagingFs>(fs: &F, path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = fs
        .create_with_mode(path, mode)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    drop(file);

    // an existing file keeps its old mode, and the server's umask applies
    fs.set_mode(path, mode)
        .with_context(|| format!("failed to set mode {:o} on {}", mode, path.display()))
}

/// Copy two non-blocking streams into their sinks, alternating between them,
/// until `at_eof(out)` reports the end and neither stream has data left.
fn drain_interleaved<O: Read, E: Read>(
    out: &mut O,
    err: &mut E,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    mut at_eof: impl FnMut(&O) -> bool,
) -> Result<()> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        // checked before reading so data arriving with the EOF is not lost
        let eof = at_eof(out);
        let got_out = forward_some(out, &mut buf, stdout).context("failed to forward stdout")?;
        let got_err = forward_some(err, &mut buf, stderr).context("failed to forward stderr")?;

        if got_out == 0 && got_err == 0 {
            if eof {
                return Ok(());
            }
            std::thread::sleep(IDLE_POLL);
        }
    }
}

fn forward_some<R: Read>(src: &mut R, buf: &mut [u8], sink: &mut dyn Write) -> std::io::Result<usize> {
    match src.read(buf) {
        Ok(n) => {
            sink.write_all(&buf[..n])?;
            Ok(n)
        }
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ExecEnv for SshEnv {
    async fn write_file(&self, name: &str, data: Vec<u8>, mode: u32) -> Result<()> {
        let session = self.session.clone();
        let path = self.remote_path(name);
        debug!(addr = %self.addr, path = %path.display(), "staging file over sftp");

        tokio::task::spawn_blocking(move || -> Result<()> {
            let sftp = session.sftp().context("failed to open sftp channel")?;
            stage_file(&sftp, &path, &data, mode)
        })
        .await
        .context("sftp task panicked")?
    }

    fn command(
        &self,
        cmd: &str,
        args: &[String],
        mut stdout: OutputSink,
        mut stderr: OutputSink,
    ) -> PendingCommand {
        let session = self.session.clone();
        let line = remote_command_line(&self.work_dir, cmd, args);
        let addr = self.addr.clone();

        PendingCommand::new(line.clone(), move || {
            debug!(%addr, command = %line, "ssh run");
            let mut channel = session.channel_session().context("failed to open ssh session")?;
            channel.exec(&line).context("failed to exec remote command")?;

            let mut err_stream = channel.stderr();
            session.set_blocking(false);
            let drained = drain_interleaved(
                &mut channel,
                &mut err_stream,
                &mut stdout,
                &mut stderr,
                |c| c.eof(),
            );
            session.set_blocking(true);
            drained?;
            drop(stdout);

            channel.wait_close()?;
            let status = channel.exit_status()?;
            if status != 0 {
                bail!("remote command exited with status {}", status);
            }
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let session = self.session.clone();
        let cmd = format!("rm -rf {}", shellwords::escape(&self.work_dir));
        let addr = self.addr.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let res = exec_capture(&session, &cmd);
            let _ = session.disconnect(None, "done", None);
            match res? {
                (_, 0) => Ok(()),
                (_, status) => bail!("cleanup on {} exited with status {}", addr, status),
            }
        })
        .await
        .context("ssh close task panicked")?
    }

    fn name(&self) -> &'static str {
        "ssh"
    }

    fn work_dir(&self) -> &str {
        &self.work_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Non-blocking stream replaying a script of reads; `None` means
    /// "would block".
    struct Scripted(VecDeque<Option<Vec<u8>>>);

    impl Scripted {
        fn new(steps: Vec<Option<&[u8]>>) -> Self {
            Self(steps.into_iter().map(|s| s.map(<[u8]>::to_vec)).collect())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                Some(Some(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(None) => Err(ErrorKind::WouldBlock.into()),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_stderr_is_drained_while_stdout_waits() {
        let noise = vec![b'e'; 16 * 1024];
        // stdout only makes progress after stderr has been read
        let mut out = Scripted::new(vec![None, None, Some(&b"BenchmarkSpec 1 1 ns/op\n"[..])]);
        let mut err = Scripted::new(vec![Some(&noise[..]), Some(&noise[..]), None]);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let mut polls = 0;
        drain_interleaved(&mut out, &mut err, &mut stdout, &mut stderr, |_| {
            polls += 1;
            polls > 4
        })
        .unwrap();

        assert_eq!(stdout, b"BenchmarkSpec 1 1 ns/op\n");
        assert_eq!(stderr.len(), 32 * 1024);
    }

    #[test]
    fn test_data_arriving_with_eof_is_kept() {
        let mut out = Scripted::new(vec![Some(&b"tail"[..])]);
        let mut err = Scripted::new(vec![]);
        let mut stdout = Vec::new();
        drain_interleaved(&mut out, &mut err, &mut stdout, &mut std::io::sink(), |_| true)
            .unwrap();
        assert_eq!(stdout, b"tail");
    }

    /// Records requested modes and refuses to chmod.
    #[derive(Default)]
    struct NoChmod {
        created: RefCell<Vec<(PathBuf, u32)>>,
    }

    impl StagingFs for NoChmod {
        type File = std::io::Sink;

        fn create_with_mode(&self, path: &Path, mode: u32) -> Result<Self::File> {
            self.created.borrow_mut().push((path.to_path_buf(), mode));
            Ok(std::io::sink())
        }

        fn set_mode(&self, _path: &Path, _mode: u32) -> Result<()> {
            bail!("permission denied")
        }
    }

    #[test]
    fn test_staging_fails_when_mode_cannot_be_set() {
        let fs = NoChmod::default();
        let err = stage_file(&fs, Path::new("/tmp/x/worker.test"), b"bin", 0o755).unwrap_err();

        assert_eq!(
            *fs.created.borrow(),
            vec![(PathBuf::from("/tmp/x/worker.test"), 0o755)]
        );
        assert!(err.to_string().contains("failed to set mode 755"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.1:2222"), ("10.0.0.1", 2222));
        assert_eq!(split_host_port("bench-1"), ("bench-1", 22));
        assert_eq!(split_host_port("bench-1:ssh"), ("bench-1:ssh", 22));
    }

    #[test]
    fn test_remote_command_line_escapes_args() {
        let line = remote_command_line(
            "/tmp/tmp.abc",
            "/usr/bin/env",
            &[
                "bash".to_string(),
                "-c".to_string(),
                "./prerun.sh /mnt/disk 'xfs'".to_string(),
            ],
        );
        assert!(line.starts_with("cd /tmp/tmp.abc && /usr/bin/env bash -c "));
        // the script line stays a single shell word
        let words = shellwords::split(&line).unwrap();
        assert_eq!(words.last().unwrap(), "./prerun.sh /mnt/disk 'xfs'");
    }
}
