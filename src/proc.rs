//! Local child processes with asynchronous line streams.
//!
//! `Proc::spawn` splits a child into a control half (`Proc`: liveness, signal
//! delivery, stdin closing) and an event half (`ProcEvents`: stdout lines,
//! stderr lines, completion). The halves can live in different tasks, which is
//! how a host's master connection is stopped from the foreground while its
//! monitor loop consumes the events.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::log::Logger;
use crate::{jlog, jlog_debug, Error, Result};

/// How long to wait for trailing output after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Control half of a spawned child.
#[derive(Debug)]
pub struct Proc {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    alive: Arc<AtomicBool>,
}

/// Event half of a spawned child.
#[derive(Debug)]
pub struct ProcEvents {
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    pub done: oneshot::Receiver<std::io::Result<ExitStatus>>,
}

impl Proc {
    /// Spawn `cmd` with all three standard streams piped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(cmd: &mut Command) -> Result<(Proc, ProcEvents)> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        let stdin = child.stdin.take();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, out_tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, err_tx)));
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = oneshot::channel();
        let alive_flag = Arc::clone(&alive);
        tokio::spawn(async move {
            let status = child.wait().await;
            alive_flag.store(false, Ordering::SeqCst);
            // Give the readers a chance to flush, unless a grandchild keeps the pipes open.
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(readers)).await;
            let _ = done_tx.send(status);
        });

        Ok((
            Proc { pid, stdin, alive },
            ProcEvents {
                stdout: out_rx,
                stderr: err_rx,
                done: done_rx,
            },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Close the child's stdin. Idempotent.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Deliver `signal` to the child.
    pub fn signal(&self, signal: libc::c_int) -> Result<()> {
        let Some(pid) = self.pid.filter(|_| self.is_alive()) else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| Error::Validation(format!("pid {} out of range", pid)))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Send SIGINT, the "normal stop" request for ssh.
    pub fn interrupt(&self) -> Result<()> {
        self.signal(libc::SIGINT)
    }

    /// Forward output to `log` until the child exits.
    ///
    /// If `cancel` fires first, stdin is closed and the child interrupted; the
    /// call still waits for the exit and then returns `Error::Cancelled`.
    pub async fn drive(
        self,
        events: ProcEvents,
        log: &Logger,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        self.wait_with(events, log, cancel, None).await
    }

    /// Like `drive`, but stdout is collected and returned instead of logged.
    pub async fn capture(
        self,
        events: ProcEvents,
        log: &Logger,
        cancel: &CancellationToken,
    ) -> Result<(ExitStatus, Vec<String>)> {
        let mut stdout = Vec::new();
        let status = self.wait_with(events, log, cancel, Some(&mut stdout)).await?;
        Ok((status, stdout))
    }

    async fn wait_with(
        mut self,
        mut events: ProcEvents,
        log: &Logger,
        cancel: &CancellationToken,
        mut stdout: Option<&mut Vec<String>>,
    ) -> Result<ExitStatus> {
        let mut cancelled = false;
        let mut stdout_open = true;
        let mut stderr_open = true;

        let status = loop {
            tokio::select! {
                line = events.stdout.recv(), if stdout_open => match line {
                    Some(line) => emit_stdout(line, log, &mut stdout),
                    None => stdout_open = false,
                },
                line = events.stderr.recv(), if stderr_open => match line {
                    Some(line) => jlog!(log, "{}", line),
                    None => stderr_open = false,
                },
                status = &mut events.done => {
                    break status.map_err(|_| Error::TaskJoin("process waiter dropped".to_string()))?;
                }
                _ = cancel.cancelled(), if !cancelled => {
                    jlog_debug!(log, "interrupting pid {:?}", self.pid);
                    cancelled = true;
                    self.close_stdin();
                    self.interrupt()?;
                }
            }
        };

        while let Ok(line) = events.stdout.try_recv() {
            emit_stdout(line, log, &mut stdout);
        }
        while let Ok(line) = events.stderr.try_recv() {
            jlog!(log, "{}", line);
        }

        if cancelled {
            return Err(Error::Cancelled);
        }
        Ok(status?)
    }
}

fn emit_stdout(line: String, log: &Logger, captured: &mut Option<&mut Vec<String>>) {
    match captured {
        Some(lines) => lines.push(line),
        None => jlog!(log, "{}", line),
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}
