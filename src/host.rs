//! Remote targets and their control connections.
//!
//! A `Host` lives for the whole process. Its two mutable fields, the remote
//! workspace path and the master process, sit behind their own mutexes and are
//! only touched by that host's own tasks: the deployment pipeline and the
//! master monitor loop. Running two jobs against one host at the same time is
//! not supported.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::log::Logger;
use crate::proc::{Proc, ProcEvents};
use crate::transport::Transport;
use crate::util::shell_escape;
use crate::{jlog, jlog_debug, jlog_error, jlog_warn, Result};

/// How long a master gets to exit after SIGINT before it is killed.
const MASTER_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Host {
    name: String,
    env: BTreeMap<String, String>,
    groups: Vec<String>,
    workspace: Mutex<Option<String>>,
    master: Mutex<Option<Proc>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    log: Logger,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Host {
    pub fn new(name: &str, log: &Logger) -> Self {
        let mut env = BTreeMap::new();
        env.insert("HOSTNAME".to_string(), name.to_string());
        Self {
            name: name.to_string(),
            env,
            groups: Vec::new(),
            workspace: Mutex::new(None),
            master: Mutex::new(None),
            monitor: Mutex::new(None),
            cancel: CancellationToken::new(),
            log: log.for_host(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn add_group(&mut self, group: &str) {
        if !self.groups.iter().any(|g| g == group) {
            self.groups.push(group.to_string());
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Remote temporary directory of the deployment in flight, if any.
    pub fn workspace(&self) -> Option<String> {
        lock(&self.workspace).clone()
    }

    pub(crate) fn set_workspace(&self, workspace: Option<String>) {
        *lock(&self.workspace) = workspace;
    }

    /// Prefix `command` with this host's environment overlay.
    pub fn remote_command(&self, command: &str) -> String {
        let exports = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_escape(v)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("export {}; {}", exports, command)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cancellation of the master and of any remote step in flight.
    ///
    /// Never blocks. Every listener on this host's token is notified, and the
    /// cancellation stays in effect for the rest of the process.
    pub fn cancel(&self) {
        jlog_debug!(self.log, "cancel requested");
        self.cancel.cancel();
    }

    /// Whether a master connection is currently registered.
    pub fn has_master(&self) -> bool {
        lock(&self.master).is_some()
    }

    /// Open the control connection and start its monitor loop.
    ///
    /// # Panics
    /// If a master is already registered for this host. Starting a second
    /// master is a caller bug, not a recoverable condition.
    pub fn start_master(self: &Arc<Self>, transport: &dyn Transport) -> Result<()> {
        let events = {
            let mut slot = lock(&self.master);
            if slot.is_some() {
                panic!("there already is a control connection to {}", self.name);
            }
            let (proc, events) = transport.open_master(self)?;
            jlog_debug!(self.log, "control connection started (pid {:?})", proc.pid());
            *slot = Some(proc);
            events
        };

        let host = Arc::clone(self);
        let monitor = tokio::spawn(async move { host.monitor_master(events).await });
        *lock(&self.monitor) = Some(monitor);
        Ok(())
    }

    /// Ask the master to stop. Returns without waiting for it to exit; the
    /// monitor loop observes the exit and clears the handle.
    pub fn stop_master(&self) -> Result<()> {
        let slot = lock(&self.master);
        match slot.as_ref() {
            Some(proc) if proc.is_alive() => {
                jlog_debug!(self.log, "stopping control connection");
                proc.interrupt()
            }
            _ => {
                jlog!(self.log, "there was no control connection to stop");
                Ok(())
            }
        }
    }

    /// Wait until the monitor loop has seen the master exit and cleared it.
    ///
    /// Call after `stop_master`. A master still running after
    /// `MASTER_EXIT_TIMEOUT` is killed. Returns at once if no master was
    /// started.
    pub async fn wait_master(&self) {
        let monitor = lock(&self.monitor).take();
        let Some(mut monitor) = monitor else {
            return;
        };
        if tokio::time::timeout(MASTER_EXIT_TIMEOUT, &mut monitor).await.is_ok() {
            return;
        }

        jlog_warn!(self.log, "control connection ignored the interrupt, killing it");
        let killed = {
            let slot = lock(&self.master);
            match slot.as_ref() {
                Some(proc) => proc.signal(libc::SIGKILL),
                None => Ok(()),
            }
        };
        if let Err(e) = killed {
            jlog_error!(self.log, "failed to kill control connection: {}", e);
        }
        if let Err(e) = monitor.await {
            jlog_error!(self.log, "control connection monitor failed: {}", e);
        }
    }

    async fn monitor_master(self: Arc<Self>, mut events: ProcEvents) {
        let cancel = self.cancel.clone();
        let mut stopping = false;
        let mut stdout_open = true;
        let mut stderr_open = true;

        while self.has_master() {
            tokio::select! {
                line = events.stdout.recv(), if stdout_open => match line {
                    Some(line) => jlog!(self.log, "{}", line),
                    None => stdout_open = false,
                },
                line = events.stderr.recv(), if stderr_open => match line {
                    Some(line) => jlog!(self.log, "{}", line),
                    None => stderr_open = false,
                },
                status = &mut events.done => {
                    while let Ok(line) = events.stdout.try_recv() {
                        jlog!(self.log, "{}", line);
                    }
                    while let Ok(line) = events.stderr.try_recv() {
                        jlog!(self.log, "{}", line);
                    }
                    match status {
                        Ok(Ok(status)) if status.success() => {
                            jlog_debug!(self.log, "control connection closed");
                        }
                        Ok(Ok(status)) => {
                            jlog_warn!(self.log, "control connection exited with {}", status);
                        }
                        Ok(Err(e)) => jlog_error!(self.log, "control connection failed: {}", e),
                        Err(_) => jlog_error!(self.log, "control connection waiter dropped"),
                    }
                    lock(&self.master).take();
                }
                _ = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    {
                        let mut slot = lock(&self.master);
                        if let Some(proc) = slot.as_mut() {
                            proc.close_stdin();
                        }
                    }
                    if let Err(e) = self.stop_master() {
                        jlog_warn!(self.log, "failed to stop control connection: {}", e);
                    }
                }
            }
        }
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("groups", &self.groups)
            .field("env", &self.env)
            .field("workspace", &self.workspace())
            .field("master", &self.has_master())
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
