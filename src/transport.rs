//! Remote execution and file transfer.
//!
//! `Transport` is the seam between the host pipelines and the wire. The
//! production implementation, `SshTransport`, shells out to OpenSSH and shares
//! one control socket per host so that the master opened by
//! `Host::start_master` accelerates every later `ssh`/`scp` call.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::host::Host;
use crate::proc::{Proc, ProcEvents};
use crate::{jlog_debug, jlog_trace, Error, Result};

/// Exit status OpenSSH uses for its own (connection level) failures.
const SSH_FAILURE_CODE: i32 = 255;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on `host` and wait for it, forwarding its output to the
    /// host's log. A non-zero exit becomes an error.
    async fn run(&self, host: &Host, command: &str, cancel: &CancellationToken) -> Result<()>;

    /// Run `command` on `host` and return the first line of its stdout.
    async fn read_line(
        &self,
        host: &Host,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Copy a local file or directory tree into the remote directory `remote_dir`.
    async fn copy(
        &self,
        host: &Host,
        local: &Path,
        remote_dir: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Open a persistent control connection to `host`.
    fn open_master(&self, host: &Host) -> Result<(Proc, ProcEvents)>;
}

/// OpenSSH-backed transport.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    scp: PathBuf,
    options: Vec<String>,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(ssh: PathBuf, scp: PathBuf, options: Vec<String>, control_dir: PathBuf) -> Self {
        Self {
            ssh,
            scp,
            options,
            control_dir,
        }
    }

    /// Resolve the `ssh` and `scp` binaries and prepare the control socket directory.
    pub fn from_config(config: &Config) -> Result<Self> {
        let ssh = which::which(config.effective_ssh())
            .map_err(|_| Error::Transport(format!("{} not found", config.effective_ssh())))?;
        let scp = which::which(config.effective_scp())
            .map_err(|_| Error::Transport(format!("{} not found", config.effective_scp())))?;

        let control_dir = config.control_dir()?;
        std::fs::create_dir_all(&control_dir)?;
        std::fs::set_permissions(&control_dir, std::fs::Permissions::from_mode(0o700))?;

        Ok(Self::new(ssh, scp, config.ssh_options.clone(), control_dir))
    }

    fn control_path(&self) -> String {
        format!("ControlPath={}/%r@%h:%p", self.control_dir.display())
    }

    /// `ssh [options] -o ControlPath=... -- host command`
    pub fn ssh_command(&self, host: &Host, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(&self.options)
            .arg("-o")
            .arg(self.control_path())
            .arg("--")
            .arg(host.name())
            .arg(remote);
        cmd
    }

    /// `ssh [options] -o ControlPath=... -M -N -- host`
    pub fn master_command(&self, host: &Host) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(&self.options)
            .arg("-o")
            .arg(self.control_path())
            .arg("-M")
            .arg("-N")
            .arg("--")
            .arg(host.name());
        cmd
    }

    /// `scp [-r] [options] -o ControlPath=... -- local host:remote_dir`
    pub fn scp_command(&self, host: &Host, local: &Path, remote_dir: &str) -> Command {
        let mut cmd = Command::new(&self.scp);
        if local.is_dir() {
            cmd.arg("-r");
        }
        cmd.args(&self.options)
            .arg("-o")
            .arg(self.control_path())
            .arg("--")
            .arg(local)
            .arg(format!("{}:{}", host.name(), remote_dir));
        cmd
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(&self, host: &Host, command: &str, cancel: &CancellationToken) -> Result<()> {
        jlog_debug!(host.log(), "ssh: {}", command);
        let (proc, events) = spawn(host, &mut self.ssh_command(host, command))?;
        let status = proc.drive(events, host.log(), cancel).await?;
        check_ssh_status(command, status)
    }

    async fn read_line(
        &self,
        host: &Host,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        jlog_debug!(host.log(), "ssh (read): {}", command);
        let (proc, events) = spawn(host, &mut self.ssh_command(host, command))?;
        let (status, stdout) = proc.capture(events, host.log(), cancel).await?;
        check_ssh_status(command, status)?;

        stdout
            .first()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::Transport(format!("no output from `{}`", command)))
    }

    async fn copy(
        &self,
        host: &Host,
        local: &Path,
        remote_dir: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        jlog_debug!(host.log(), "scp: {} -> {}", local.display(), remote_dir);
        let (proc, events) = spawn(host, &mut self.scp_command(host, local, remote_dir))?;
        let status = proc.drive(events, host.log(), cancel).await?;
        if !status.success() {
            return Err(Error::Transport(format!(
                "copying {} to {}:{} failed with {}",
                local.display(),
                host.name(),
                remote_dir,
                status
            )));
        }
        Ok(())
    }

    fn open_master(&self, host: &Host) -> Result<(Proc, ProcEvents)> {
        jlog_debug!(host.log(), "opening control connection");
        spawn(host, &mut self.master_command(host))
    }
}

fn spawn(host: &Host, cmd: &mut Command) -> Result<(Proc, ProcEvents)> {
    jlog_trace!(host.log(), "exec {:?}", cmd.as_std());
    Proc::spawn(cmd)
}

/// Map an ssh exit status to the error taxonomy.
pub fn check_ssh_status(command: &str, status: ExitStatus) -> Result<()> {
    match status.code() {
        Some(0) => Ok(()),
        Some(SSH_FAILURE_CODE) => Err(Error::Transport(format!(
            "ssh failed while running `{}`",
            command
        ))),
        code => Err(Error::RemoteCommand {
            command: command.to_string(),
            code,
        }),
    }
}
