//! Control connection lifecycle tests.
//!
//! A fake master is a local shell process: it keeps running until its stdin
//! is closed or it receives SIGINT, like `ssh -M -N`.

use std::time::{Duration, Instant};

use judo::log::LogLevel;
use judo::Logger;

use super::fixtures::{host, wait_until, Call, RecordingTransport};

const SETTLE: Duration = Duration::from_secs(5);

/// Test: Master output reaches the host log
/// Given a master that prints a line
/// When the connection is started
/// Then the line is logged with the host prefix and the master is registered
#[tokio::test]
async fn test_start_master_forwards_output() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new().master_script(Some("echo master up; exec cat"));

    web1.start_master(&transport).unwrap();
    assert!(web1.has_master());
    assert_eq!(
        transport.calls(),
        vec![Call::OpenMaster {
            host: "web1".to_string()
        }]
    );

    let logged = wait_until(SETTLE, || {
        log.lines().contains(&"web1: master up".to_string())
    })
    .await;
    assert!(logged, "master output should be forwarded, got {:?}", log.lines());

    web1.stop_master().unwrap();
    assert!(wait_until(SETTLE, || !web1.has_master()).await);
}

/// Test: Stop returns before the master exits
/// Given an active master
/// When stop_master is called
/// Then it returns Ok at once and the monitor clears the handle later
#[tokio::test]
async fn test_stop_master_is_asynchronous() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new();

    web1.start_master(&transport).unwrap();
    assert!(web1.stop_master().is_ok());

    assert!(
        wait_until(SETTLE, || !web1.has_master()).await,
        "monitor loop should clear the master after it exits"
    );
}

/// Test: Waiting for the master after a stop
/// Given an active master that was asked to stop
/// When wait_master returns
/// Then the handle is already cleared and a new master can start
#[tokio::test]
async fn test_wait_master_after_stop() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new();

    web1.start_master(&transport).unwrap();
    web1.stop_master().unwrap();
    web1.wait_master().await;
    assert!(!web1.has_master());

    web1.start_master(&transport).unwrap();
    web1.stop_master().unwrap();
    web1.wait_master().await;
    assert!(!web1.has_master());
}

/// Test: A master that ignores SIGINT is killed
#[tokio::test]
async fn test_wait_master_kills_stubborn_master() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport =
        RecordingTransport::new().master_script(Some("trap '' INT; echo ready; exec cat"));

    web1.start_master(&transport).unwrap();
    assert!(wait_until(SETTLE, || log.lines().contains(&"web1: ready".to_string())).await);
    web1.stop_master().unwrap();

    tokio::time::timeout(SETTLE, web1.wait_master())
        .await
        .expect("wait_master should give up on the interrupt and kill");
    assert!(!web1.has_master());
    assert!(log
        .lines()
        .contains(&"web1: control connection ignored the interrupt, killing it".to_string()));
}

/// Test: Waiting without a master returns at once
#[tokio::test]
async fn test_wait_master_without_master() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    tokio::time::timeout(Duration::from_millis(100), web1.wait_master())
        .await
        .unwrap();
}

/// Test: Stop without a master
/// Given a host whose master already exited
/// When stop_master is called
/// Then it succeeds and logs an informational notice
#[tokio::test]
async fn test_stop_after_master_exited_logs_notice() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new().master_script(Some("exit 0"));

    web1.start_master(&transport).unwrap();
    assert!(wait_until(SETTLE, || !web1.has_master()).await);

    assert!(web1.stop_master().is_ok());
    assert!(log.records().contains(&(
        LogLevel::Info,
        "web1: there was no control connection to stop".to_string()
    )));
}

/// Test: Master failure is logged
/// Given a master that exits non-zero
/// When it terminates
/// Then its stderr and the exit status are logged and the handle is cleared
#[tokio::test]
async fn test_master_exit_error_is_logged() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new()
        .master_script(Some("echo 'Permission denied (publickey)' >&2; exit 255"));

    web1.start_master(&transport).unwrap();
    assert!(wait_until(SETTLE, || !web1.has_master()).await);

    let lines = log.lines();
    assert!(lines.contains(&"web1: Permission denied (publickey)".to_string()));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("web1: control connection exited with")));
}

/// Test: Double start is a programmer error
#[tokio::test]
#[should_panic(expected = "there already is a control connection to web1")]
async fn test_second_start_panics() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new();

    web1.start_master(&transport).unwrap();
    let _ = web1.start_master(&transport);
}

/// Test: Opening failure leaves the host idle
#[tokio::test]
async fn test_open_failure_keeps_host_idle() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new().master_script(None);

    assert!(web1.start_master(&transport).is_err());
    assert!(!web1.has_master());

    // A later start is allowed.
    let transport = RecordingTransport::new();
    web1.start_master(&transport).unwrap();
    web1.stop_master().unwrap();
}

/// Test: Cancel stops the master
/// Given an active master that only exits when its stdin closes or on SIGINT
/// When the host is cancelled
/// Then cancel returns immediately and the monitor shuts the master down
#[tokio::test]
async fn test_cancel_stops_master() {
    let log = Logger::memory();
    let web1 = host("web1", &log);
    let transport = RecordingTransport::new();

    web1.start_master(&transport).unwrap();

    let started = Instant::now();
    web1.cancel();
    assert!(started.elapsed() < Duration::from_millis(50));

    assert!(wait_until(SETTLE, || !web1.has_master()).await);
    assert!(web1.is_cancelled());
}

/// Test: Cancel with no listener never blocks
#[tokio::test]
async fn test_cancel_without_listeners_returns() {
    let log = Logger::memory();
    let web1 = host("web1", &log);

    let started = Instant::now();
    web1.cancel();
    web1.cancel();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(web1.cancel_token().is_cancelled());
}
