//! Inventory file parsing and target resolution.
//!
//! Format, one host per line:
//!
//! ```text
//! # comment
//! web1 web prod ROLE=frontend
//! db1  db  prod
//! ```
//!
//! The first word is the host name. Words containing `=` add to the host's
//! environment overlay; every other word is a group membership.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::host::Host;
use crate::log::Logger;
use crate::{jlog_debug, jlog_warn, Error, Result};

/// Target expanding to every inventory host, unless a group of that name exists.
pub const ALL: &str = "all";

#[derive(Debug)]
pub struct Inventory {
    hosts: Vec<Arc<Host>>,
    by_name: HashMap<String, usize>,
    groups: BTreeMap<String, Vec<usize>>,
    log: Logger,
}

impl Inventory {
    pub fn empty(log: &Logger) -> Self {
        Self {
            hosts: Vec::new(),
            by_name: HashMap::new(),
            groups: BTreeMap::new(),
            log: log.clone(),
        }
    }

    pub fn load(path: &Path, log: &Logger) -> Result<Self> {
        jlog_debug!(log, "Inventory::load path={}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Inventory(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content, log)
    }

    pub fn parse(content: &str, log: &Logger) -> Result<Self> {
        let mut inventory = Self::empty(log);
        let mut pending: Vec<Host> = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            let mut words = line.split_whitespace();
            let Some(name) = words.next() else {
                continue;
            };
            let lineno = idx + 1;

            if name.contains('=') {
                return Err(Error::Inventory(format!(
                    "line {}: expected a host name, got `{}`",
                    lineno, name
                )));
            }
            if inventory.by_name.contains_key(name) {
                return Err(Error::Inventory(format!(
                    "line {}: duplicate host `{}`",
                    lineno, name
                )));
            }

            let mut host = Host::new(name, log);
            for word in words {
                match word.split_once('=') {
                    Some((key, value)) => {
                        if !is_env_key(key) {
                            return Err(Error::Inventory(format!(
                                "line {}: invalid variable name `{}`",
                                lineno, key
                            )));
                        }
                        host.set_env(key, value);
                    }
                    None => host.add_group(word),
                }
            }

            let index = pending.len();
            inventory.by_name.insert(name.to_string(), index);
            for group in host.groups() {
                inventory.groups.entry(group.clone()).or_default().push(index);
            }
            pending.push(host);
        }

        if let Some(clash) = inventory.groups.keys().find(|g| inventory.by_name.contains_key(*g)) {
            return Err(Error::Inventory(format!(
                "`{}` is both a host and a group",
                clash
            )));
        }

        inventory.hosts = pending.into_iter().map(Arc::new).collect();
        jlog_debug!(
            log,
            "Inventory parsed: {} hosts, {} groups",
            inventory.hosts.len(),
            inventory.groups.len()
        );
        Ok(inventory)
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&Arc<Host>> {
        self.by_name.get(name).map(|&i| &self.hosts[i])
    }

    pub fn group(&self, name: &str) -> Option<Vec<Arc<Host>>> {
        self.groups
            .get(name)
            .map(|members| members.iter().map(|&i| Arc::clone(&self.hosts[i])).collect())
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Turn target names into a de-duplicated host list, in first-seen order.
    ///
    /// Groups expand to their members, known hosts resolve to themselves, and
    /// unknown names become ad-hoc hosts.
    pub fn resolve(&self, targets: &[String]) -> Result<Vec<Arc<Host>>> {
        if targets.is_empty() {
            return Err(Error::Validation("no targets given".to_string()));
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let mut push = |host: Arc<Host>| {
            if seen.insert(host.name().to_string()) {
                resolved.push(host);
            }
        };

        for target in targets {
            if let Some(members) = self.group(target) {
                members.into_iter().for_each(&mut push);
            } else if let Some(host) = self.host(target) {
                push(Arc::clone(host));
            } else if target == ALL {
                self.hosts.iter().cloned().for_each(&mut push);
            } else {
                jlog_warn!(self.log, "{} is not in the inventory, using it as a host name", target);
                push(Arc::new(Host::new(target, &self.log)));
            }
        }
        Ok(resolved)
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
