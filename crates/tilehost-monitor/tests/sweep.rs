//! Sweep scheduling and registry sweeps under paused time.

use std::sync::Arc;
use std::time::Duration;

use tilehost_config::{GameDefinition, UsernamePolicy};
use tilehost_monitor::{IdleMonitor, MonitorConfig, MonitorEvent, SweepSchedule};
use tilehost_process::ViewerId;
use tilehost_session::SessionRegistry;
use tokio::sync::watch;

fn game() -> Arc<GameDefinition> {
    Arc::new(GameDefinition {
        id: "dcss-gnollcrawl".into(),
        name: "GnollCrawl".into(),
        binary: "./crawl".into(),
        rcfile_path: "rcs".into(),
        macro_path: "rcs".into(),
        morgue_path: "rcs".into(),
        inprogress_path: "running".into(),
        ttyrec_path: "rcs".into(),
        socket_path: "sockets".into(),
        client_path: String::new(),
        morgue_url: None,
        send_json_options: true,
        options: vec![],
    })
}

fn config() -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_secs(5),
        max_idle_time: Duration::from_secs(120),
        connection_timeout: Duration::from_secs(30),
        initial_jitter: Duration::ZERO,
    }
}

// =========================================================================
// SweepSchedule
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_wait_for_sweep_fires_each_interval() {
    let mut schedule = SweepSchedule::new(Duration::from_secs(5), Duration::ZERO);
    let start = tokio::time::Instant::now();

    let first = schedule.wait_for_sweep().await;
    assert_eq!(first.sweep, 1);
    assert!(!first.overrun);
    assert_eq!(tokio::time::Instant::now() - start, Duration::from_secs(5));

    schedule.wait_for_sweep().await;
    assert_eq!(tokio::time::Instant::now() - start, Duration::from_secs(10));
    assert_eq!(schedule.metrics().total_sweeps, 2);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_sweep_late_skips_missed_intervals() {
    let mut schedule = SweepSchedule::new(Duration::from_secs(5), Duration::ZERO);
    schedule.wait_for_sweep().await;

    tokio::time::advance(Duration::from_secs(17)).await;
    let info = schedule.wait_for_sweep().await;
    assert!(info.overrun);
    assert_eq!(info.skipped, 2);
    assert_eq!(schedule.metrics().total_overruns, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_sweep_disabled_never_fires() {
    let mut schedule = SweepSchedule::new(Duration::ZERO, Duration::ZERO);
    assert!(schedule.is_disabled());
    let fired = tokio::time::timeout(Duration::from_secs(3600), schedule.wait_for_sweep()).await;
    assert!(fired.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_new_with_jitter_delays_first_sweep_at_most_jitter() {
    let start = tokio::time::Instant::now();
    let mut schedule = SweepSchedule::new(Duration::from_secs(5), Duration::from_millis(500));
    schedule.wait_for_sweep().await;
    let waited = tokio::time::Instant::now() - start;
    assert!(waited >= Duration::from_secs(5));
    assert!(waited < Duration::from_millis(5500));
}

// =========================================================================
// IdleMonitor
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_silent_connection_requests_disconnect() {
    let registry = Arc::new(SessionRegistry::new(10));
    let alice = UsernamePolicy::default().parse("Alice").unwrap();
    let session = registry.admit(&alice, &game(), ViewerId(7)).unwrap().session().clone();
    let mut kicks = session.disconnect_requests();

    let monitor = IdleMonitor::new(config());
    let mut events = monitor.subscribe();

    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(monitor.sweep(&registry).is_empty());

    tokio::time::advance(Duration::from_secs(11)).await;
    monitor.sweep(&registry);

    kicks.changed().await.unwrap();
    match events.recv().await.unwrap() {
        MonitorEvent::ConnectionClosed { username, silent_for, .. } => {
            assert_eq!(username, "Alice");
            assert_eq!(silent_for, Duration::from_secs(31));
        }
        other => panic!("unexpected event {other:?}"),
    }
    // The session itself is untouched: the handler detaches it.
    assert_eq!(registry.len(), 1);
    assert_eq!(monitor.stats().connections_closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_detached_session_without_traffic_is_not_closed() {
    let registry = Arc::new(SessionRegistry::new(10));
    let alice = UsernamePolicy::default().parse("Alice").unwrap();
    let session = registry.admit(&alice, &game(), ViewerId(7)).unwrap().session().clone();
    session.detach(ViewerId(7));

    let monitor = IdleMonitor::new(config());
    tokio::time::advance(Duration::from_secs(90)).await;
    assert!(monitor.sweep(&registry).is_empty());
    assert_eq!(monitor.stats().connections_closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_sweeps_until_shutdown() {
    let registry = Arc::new(SessionRegistry::new(10));
    let monitor = IdleMonitor::new(config());
    let stats = monitor.stats();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(monitor.run(Arc::clone(&registry), rx));

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(stats.sweeps(), 3);

    tx.send(true).unwrap();
    task.await.unwrap();
}
