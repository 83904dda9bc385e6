//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A `Transport` double that records every call and fails on demand
//! - Script payloads on a temporary filesystem
//! - Polling for asynchronous state changes

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use judo::proc::{Proc, ProcEvents};
use judo::{Error, Host, Logger, Result, Script, Transport};

/// One transport invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    OpenMaster { host: String },
    Run { host: String, command: String },
    ReadLine { host: String, command: String },
    Copy { host: String, local: PathBuf, remote: String },
}

impl Call {
    pub fn host(&self) -> &str {
        match self {
            Call::OpenMaster { host }
            | Call::Run { host, .. }
            | Call::ReadLine { host, .. }
            | Call::Copy { host, .. } => host,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Call::Run { command, .. } | Call::ReadLine { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// A rule making matching `run` calls fail with an exit code.
#[derive(Debug, Clone)]
struct Failure {
    host: Option<String>,
    pattern: String,
    code: i32,
}

/// Transport double. Every call is recorded; behavior is configured with
/// the builder methods before the transport is shared.
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    failures: Vec<Failure>,
    hang_on: Option<String>,
    fail_mktemp: bool,
    fail_copy: bool,
    panic_on_copy: Option<String>,
    master_script: Option<String>,
    counter: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Vec::new(),
            hang_on: None,
            fail_mktemp: false,
            fail_copy: false,
            panic_on_copy: None,
            master_script: Some("exec cat".to_string()),
            counter: AtomicUsize::new(0),
        }
    }

    /// `run` calls containing `pattern` exit with `code`, on any host.
    pub fn fail_on(mut self, pattern: &str, code: i32) -> Self {
        self.failures.push(Failure {
            host: None,
            pattern: pattern.to_string(),
            code,
        });
        self
    }

    /// `run` calls containing `pattern` on `host` exit with `code`.
    pub fn fail_on_host(mut self, host: &str, pattern: &str, code: i32) -> Self {
        self.failures.push(Failure {
            host: Some(host.to_string()),
            pattern: pattern.to_string(),
            code,
        });
        self
    }

    /// `run` and `read_line` calls containing `pattern` block until cancelled.
    pub fn hang_on(mut self, pattern: &str) -> Self {
        self.hang_on = Some(pattern.to_string());
        self
    }

    pub fn fail_mktemp(mut self) -> Self {
        self.fail_mktemp = true;
        self
    }

    pub fn fail_copy(mut self) -> Self {
        self.fail_copy = true;
        self
    }

    /// `copy` panics when targeting `host`.
    pub fn panic_on_copy(mut self, host: &str) -> Self {
        self.panic_on_copy = Some(host.to_string());
        self
    }

    /// Shell script standing in for `ssh -M -N`; `None` makes opening fail.
    pub fn master_script(mut self, script: Option<&str>) -> Self {
        self.master_script = script.map(String::from);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, host: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.host() == host)
            .collect()
    }

    /// Commands of `run` calls for `host` that start with `prefix`.
    pub fn runs_starting_with(&self, host: &str, prefix: &str) -> Vec<String> {
        self.calls_for(host)
            .into_iter()
            .filter_map(|c| match c {
                Call::Run { command, .. } if command.starts_with(prefix) => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn hang_if_matching(&self, command: &str, cancel: &CancellationToken) -> Result<()> {
        match &self.hang_on {
            Some(pattern) if command.contains(pattern.as_str()) => {
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn run(&self, host: &Host, command: &str, cancel: &CancellationToken) -> Result<()> {
        self.record(Call::Run {
            host: host.name().to_string(),
            command: command.to_string(),
        });

        self.hang_if_matching(command, cancel).await?;

        let failure = self.failures.iter().find(|f| {
            f.host.as_deref().map_or(true, |h| h == host.name()) && command.contains(&f.pattern)
        });
        match failure {
            Some(f) if f.code == 255 => Err(Error::Transport(format!("ssh failed running `{}`", command))),
            Some(f) => Err(Error::RemoteCommand {
                command: command.to_string(),
                code: Some(f.code),
            }),
            None => Ok(()),
        }
    }

    async fn read_line(
        &self,
        host: &Host,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.record(Call::ReadLine {
            host: host.name().to_string(),
            command: command.to_string(),
        });
        self.hang_if_matching(command, cancel).await?;
        if self.fail_mktemp {
            return Err(Error::RemoteCommand {
                command: command.to_string(),
                code: Some(1),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("/home/{}/.judo/tmp.{:04}", host.name(), n))
    }

    async fn copy(
        &self,
        host: &Host,
        local: &Path,
        remote_dir: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(Call::Copy {
            host: host.name().to_string(),
            local: local.to_path_buf(),
            remote: remote_dir.to_string(),
        });
        if self.panic_on_copy.as_deref() == Some(host.name()) {
            panic!("copy to {} exploded", host.name());
        }
        if self.fail_copy {
            return Err(Error::Transport("scp: connection lost".to_string()));
        }
        Ok(())
    }

    fn open_master(&self, host: &Host) -> Result<(Proc, ProcEvents)> {
        self.record(Call::OpenMaster {
            host: host.name().to_string(),
        });
        match &self.master_script {
            Some(script) => {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(script);
                Proc::spawn(&mut cmd)
            }
            None => Err(Error::Transport("master refused".to_string())),
        }
    }
}

/// Local script payloads in a temporary directory.
pub struct Payloads {
    pub temp_dir: TempDir,
}

impl Payloads {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// A single-file script named `hello.sh`.
    pub fn file_script(&self) -> Script {
        let path = self.temp_dir.path().join("hello.sh");
        std::fs::write(&path, "#!/bin/sh\necho hello\n").expect("Failed to write script");
        Script::new(&path).expect("Failed to build script")
    }

    /// A directory-mode script named `bootstrap/` with its `script` entry point.
    pub fn dir_script(&self) -> Script {
        let dir = self.temp_dir.path().join("bootstrap");
        std::fs::create_dir_all(&dir).expect("Failed to create bootstrap dir");
        std::fs::write(dir.join("script"), "#!/bin/sh\n./setup\n").expect("Failed to write entry point");
        std::fs::write(dir.join("setup"), "#!/bin/sh\ntrue\n").expect("Failed to write helper");
        Script::new(&dir).expect("Failed to build script")
    }
}

pub fn host(name: &str, log: &Logger) -> Arc<Host> {
    Arc::new(Host::new(name, log))
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
