//! Runs the milestone tail as a background task against a real file.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilehost_record::{MilestoneEntry, MilestoneRouter, MilestoneTail};
use tokio::sync::watch;

#[derive(Default)]
struct Latest(Mutex<Vec<(String, String)>>);

impl MilestoneRouter for Latest {
    fn route(&self, entry: &MilestoneEntry) -> bool {
        self.0
            .lock()
            .unwrap()
            .push((entry.name().to_string(), entry.summary()));
        true
    }
}

#[tokio::test]
async fn test_tail_routes_lines_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("milestones");

    let router = Arc::new(Latest::default());
    let tail = MilestoneTail::new(&path, Duration::from_millis(10));
    let stats = tail.stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(tail.run(Arc::clone(&router), shutdown_rx));

    // Created after the tail started: read from the beginning.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "name=Alice:milestone=entered the Dungeon.").unwrap();
    writeln!(file, "broken line").unwrap();
    file.flush().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.routed() + stats.dropped() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "tail never caught up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(
        *router.0.lock().unwrap(),
        [("Alice".to_string(), "entered the Dungeon.".to_string())]
    );
    assert_eq!(stats.malformed(), 1);
}
