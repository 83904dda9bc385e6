//! Per-host pipelines: script deployment and ad-hoc commands.
//!
//! A script deployment runs, strictly in order for one host:
//! connect, ensure workspace root, `mktemp -d`, upload, run, `rm -r`, disconnect
//! and wait for the master to exit.
//! Once the temporary directory exists it is removed on every exit path:
//! after a successful run, after a failed run or upload, and while a panic
//! from the upload/run steps unwinds.

use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::host::Host;
use crate::script::{Command, Script};
use crate::transport::Transport;
use crate::util::{check_remote_dir, shell_escape};
use crate::{jlog_debug, jlog_warn, Error, Result};

/// Stops the host's master when dropped, including during unwinding.
struct MasterGuard<'a>(&'a Host);

impl Drop for MasterGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.stop_master() {
            jlog_warn!(self.0.log(), "failed to stop control connection: {}", e);
        }
    }
}

/// Upload `script` to `host`, run it, and remove it again.
///
/// `remote_dir` is the workspace root relative to the remote `$HOME`; it must
/// be a plain shell word. A cleanup failure takes precedence over the run
/// outcome. On return the host's master has exited, so the host can be used
/// by the next job right away.
///
/// # Panics
/// Re-raises any panic from the upload/run steps after cleanup. If cleanup
/// itself fails during that unwinding, panics with the cleanup error instead.
pub async fn send_remote_and_run(
    host: &Arc<Host>,
    transport: &dyn Transport,
    script: &Script,
    remote_dir: &str,
) -> Result<()> {
    let remote_dir = check_remote_dir(remote_dir)?;
    if host.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // The master only speeds things up; without it ssh connects directly.
    if let Err(e) = host.start_master(transport) {
        jlog_warn!(host.log(), "could not start control connection: {}", e);
    }
    let master = MasterGuard(host);

    let outcome = deploy_in_workspace(host, transport, script, remote_dir).await;

    drop(master);
    host.wait_master().await;
    outcome
}

async fn deploy_in_workspace(
    host: &Host,
    transport: &dyn Transport,
    script: &Script,
    remote_dir: &str,
) -> Result<()> {
    let cancel = host.cancel_token();
    let root = format!("\"$HOME\"/{}", remote_dir);
    transport
        .run(host, &format!("mkdir -p {}", root), &cancel)
        .await?;
    let workspace = transport
        .read_line(host, &format!("mktemp -d {}/tmp.XXXXXXXXXX", root), &cancel)
        .await?;
    jlog_debug!(host.log(), "workspace {}", workspace);
    host.set_workspace(Some(workspace.clone()));

    let attempt = AssertUnwindSafe(upload_and_run(host, transport, script, &workspace, &cancel))
        .catch_unwind()
        .await;

    let run_outcome = match attempt {
        Ok(outcome) => outcome,
        Err(panic) => {
            if let Err(e) = cleanup(host, transport, &workspace).await {
                panic!(
                    "{}: remote cleanup failed while handling a fault: {}",
                    host.name(),
                    e
                );
            }
            resume_unwind(panic);
        }
    };

    cleanup(host, transport, &workspace).await?;
    run_outcome
}

async fn upload_and_run(
    host: &Host,
    transport: &dyn Transport,
    script: &Script,
    workspace: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    transport.copy(host, script.path(), workspace, cancel).await?;
    let entry = script.remote_entry_point(workspace);
    transport
        .run(host, &host.remote_command(&shell_escape(&entry)), cancel)
        .await
}

/// Remove the temporary directory. Runs with its own token so that a
/// cancelled host still gets cleaned up.
async fn cleanup(host: &Host, transport: &dyn Transport, workspace: &str) -> Result<()> {
    host.set_workspace(None);
    transport
        .run(
            host,
            &format!("rm -r {}", shell_escape(workspace)),
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| Error::Cleanup {
            workspace: workspace.to_string(),
            source: Box::new(e),
        })
}

/// Run an ad-hoc command on `host`. No master, upload, or cleanup.
pub async fn run_command(host: &Host, transport: &dyn Transport, command: &Command) -> Result<()> {
    if host.is_cancelled() {
        return Err(Error::Cancelled);
    }
    transport
        .run(host, &host.remote_command(command.as_str()), &host.cancel_token())
        .await
}
