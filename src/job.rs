//! Jobs: one payload fanned out to a set of hosts.
//!
//! `Job::execute` starts one tokio task per target host with no concurrency
//! limit, waits for every task, and collects the outcomes into a `JobResult`
//! keyed by host name. One host's failure never affects another's task.

use std::collections::{BTreeMap, HashSet};
use std::panic::resume_unwind;
use std::sync::Arc;

use crate::deploy;
use crate::host::Host;
use crate::inventory::Inventory;
use crate::log::Logger;
use crate::script::{Command, Script};
use crate::transport::Transport;
use crate::util::check_remote_dir;
use crate::{jlog, jlog_error, Error, Result};

const DEFAULT_REMOTE_DIR: &str = ".judo";

/// What a job runs on each host. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Script(Script),
    Command(Command),
}

#[derive(Debug, Clone)]
pub struct Job {
    hosts: Vec<Arc<Host>>,
    payload: Arc<Payload>,
    remote_dir: String,
}

impl Job {
    /// Hosts are de-duplicated by name, keeping the first occurrence.
    pub fn new(hosts: Vec<Arc<Host>>, payload: Payload) -> Self {
        let mut seen = HashSet::new();
        let hosts = hosts
            .into_iter()
            .filter(|host| seen.insert(host.name().to_string()))
            .collect();
        Self {
            hosts,
            payload: Arc::new(payload),
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
        }
    }

    /// Build a job for `targets` as resolved by `inventory`.
    pub fn for_targets(inventory: &Inventory, targets: &[String], payload: Payload) -> Result<Self> {
        Ok(Self::new(inventory.resolve(targets)?, payload))
    }

    /// Workspace root for script payloads, relative to the remote `$HOME`.
    pub fn with_remote_dir(mut self, remote_dir: &str) -> Result<Self> {
        self.remote_dir = check_remote_dir(remote_dir)?.to_string();
        Ok(self)
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    /// Run the payload on every host concurrently and wait for all of them.
    ///
    /// # Panics
    /// If a host task panicked, the first panic is re-raised once every other
    /// host has finished (and cleaned up).
    pub async fn execute(&self, transport: Arc<dyn Transport>, log: &Logger) -> JobResult {
        let names: Vec<&str> = self.hosts.iter().map(|h| h.name()).collect();
        jlog!(log, "Running: {:?}", names);

        let mut handles = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let task_host = Arc::clone(host);
            let transport = Arc::clone(&transport);
            let payload = Arc::clone(&self.payload);
            let remote_dir = self.remote_dir.clone();
            let handle = tokio::spawn(async move {
                match payload.as_ref() {
                    Payload::Script(script) => {
                        deploy::send_remote_and_run(
                            &task_host,
                            transport.as_ref(),
                            script,
                            &remote_dir,
                        )
                        .await
                    }
                    Payload::Command(command) => {
                        deploy::run_command(&task_host, transport.as_ref(), command).await
                    }
                }
            });
            handles.push((Arc::clone(host), handle));
        }

        let mut result = JobResult::default();
        let mut fault = None;
        for (host, handle) in handles {
            match handle.await {
                Ok(outcome) => result.insert(host.name(), outcome),
                Err(e) if e.is_panic() => {
                    jlog_error!(host.log(), "task panicked");
                    if fault.is_none() {
                        fault = Some(e.into_panic());
                    }
                }
                Err(e) => result.insert(host.name(), Err(Error::TaskJoin(e.to_string()))),
            }
        }

        if let Some(panic) = fault {
            resume_unwind(panic);
        }
        result
    }
}

/// Outcome of one job execution, one entry per targeted host.
#[derive(Debug, Default)]
pub struct JobResult {
    outcomes: BTreeMap<String, Result<()>>,
}

impl JobResult {
    pub fn insert(&mut self, host: &str, outcome: Result<()>) {
        self.outcomes.insert(host.to_string(), outcome);
    }

    pub fn get(&self, host: &str) -> Option<&Result<()>> {
        self.outcomes.get(host)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<()>)> {
        self.outcomes.iter().map(|(name, outcome)| (name.as_str(), outcome))
    }

    /// Hosts whose outcome is success, by name.
    pub fn succeeded(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(name, _)| name)
            .collect()
    }

    /// Failed hosts with their errors, by name.
    pub fn failed(&self) -> Vec<(&str, &Error)> {
        self.iter()
            .filter_map(|(name, outcome)| outcome.as_ref().err().map(|e| (name, e)))
            .collect()
    }

    /// Log one line per failed host and one summary line of the successful
    /// ones. Returns `(succeeded, failed)` counts.
    pub fn report(&self, log: &Logger) -> (usize, usize) {
        let succeeded = self.succeeded();
        let failed = self.failed();

        for (host, err) in &failed {
            jlog_error!(log, "Failed: {}: {}", host, err);
        }
        if !succeeded.is_empty() {
            jlog!(log, "Success: {:?}", succeeded);
        }
        (succeeded.len(), failed.len())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let failed: serde_json::Map<String, serde_json::Value> = self
            .failed()
            .into_iter()
            .map(|(host, err)| (host.to_string(), serde_json::Value::String(err.to_string())))
            .collect();
        serde_json::json!({
            "succeeded": self.succeeded(),
            "failed": failed,
        })
    }
}
