//! Milestone ingestion.
//!
//! Games append one line per notable event to a shared milestone file in
//! the xlog format:
//!
//! ```text
//! v=0.31:name=Alice:race=Gnoll:xl=7:milestone=entered Lair of Beasts.
//! ```
//!
//! Fields are `key=value` pairs separated by `:`. A literal colon inside a
//! value is written as `::`. Entries are attributed to a session by their
//! `name` field. Lines that do not parse, or that name nobody currently
//! playing, are dropped and counted.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::MilestoneError;

/// One parsed milestone line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestoneEntry {
    fields: Vec<(String, String)>,
}

impl MilestoneEntry {
    /// Looks up a field by key. The first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The player the entry belongs to.
    pub fn name(&self) -> &str {
        // `parse` refuses entries without a name.
        self.get("name").unwrap_or_default()
    }

    /// Short human-readable text for the lobby.
    pub fn summary(&self) -> String {
        match (self.get("milestone"), self.get("type")) {
            (Some(text), _) => text.to_string(),
            (None, Some(kind)) => kind.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Parses one xlog line.
    pub fn parse(line: &str) -> Result<Self, MilestoneError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(MilestoneError::Empty);
        }

        let mut fields = Vec::new();
        for raw in split_fields(line) {
            let Some((key, value)) = raw.split_once('=') else {
                return Err(MilestoneError::MalformedField(raw));
            };
            if key.is_empty() {
                return Err(MilestoneError::MalformedField(raw));
            }
            fields.push((key.to_string(), value.to_string()));
        }

        let entry = Self { fields };
        match entry.get("name") {
            Some(name) if !name.is_empty() => Ok(entry),
            _ => Err(MilestoneError::NoName),
        }
    }
}

/// Splits on single `:`, turning `::` into a literal colon.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' {
            if chars.peek() == Some(&':') {
                chars.next();
                current.push(':');
            } else {
                fields.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

/// Receives parsed entries and attributes them to sessions.
pub trait MilestoneRouter: Send + Sync + 'static {
    /// Returns `false` if no live session matches the entry.
    fn route(&self, entry: &MilestoneEntry) -> bool;
}

/// Counters shared between the ingestion task and whoever reports on it.
#[derive(Debug, Default)]
pub struct IngestStats {
    routed: AtomicU64,
    malformed: AtomicU64,
    unattributed: AtomicU64,
}

impl IngestStats {
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn unattributed(&self) -> u64 {
        self.unattributed.load(Ordering::Relaxed)
    }

    /// Everything that was dropped, for any reason.
    pub fn dropped(&self) -> u64 {
        self.malformed() + self.unattributed()
    }
}

/// Parses one line and hands it to `router`. Never fails: a bad line is
/// counted and logged.
pub fn ingest_milestone(line: &str, router: &dyn MilestoneRouter, stats: &IngestStats) {
    match MilestoneEntry::parse(line) {
        Ok(entry) => {
            if router.route(&entry) {
                stats.routed.fetch_add(1, Ordering::Relaxed);
                trace!(name = entry.name(), "milestone routed");
            } else {
                stats.unattributed.fetch_add(1, Ordering::Relaxed);
                debug!(name = entry.name(), "milestone for unknown session dropped");
            }
        }
        Err(MilestoneError::Empty) => {}
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "malformed milestone dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// MilestoneTail
// ---------------------------------------------------------------------------

/// Follows the shared milestone file like `tail -f`.
///
/// Starts at the end of the file: entries written before the server
/// started belong to no live session. A file that does not exist yet is
/// waited for and then read from its first byte. A file that shrinks is
/// assumed rotated and read from the start.
pub struct MilestoneTail {
    path: PathBuf,
    poll_interval: Duration,
    offset: Option<u64>,
    partial: Vec<u8>,
    stats: Arc<IngestStats>,
}

impl MilestoneTail {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            offset: None,
            partial: Vec::new(),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until `shutdown` flips to `true`.
    pub async fn run<R: MilestoneRouter>(mut self, router: Arc<R>, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "milestone ingestion started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(router.as_ref()).await {
                        warn!(path = %self.path.display(), error = %e, "milestone read failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(
            routed = self.stats.routed(),
            dropped = self.stats.dropped(),
            "milestone ingestion stopped"
        );
    }

    /// Reads whatever was appended since the last poll.
    pub async fn poll(&mut self, router: &dyn MilestoneRouter) -> std::io::Result<()> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Everything written once it appears is new.
                self.offset = Some(0);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();

        let offset = match self.offset {
            None => {
                self.offset = Some(len);
                return Ok(());
            }
            Some(offset) if len < offset => {
                debug!(path = %self.path.display(), "milestone file shrank; rereading");
                self.partial.clear();
                0
            }
            Some(offset) => offset,
        };
        if len == offset {
            self.offset = Some(offset);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        let read = file.take(len - offset).read_to_end(&mut buf).await?;
        self.offset = Some(offset + read as u64);

        self.partial.extend_from_slice(&buf);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            ingest_milestone(&String::from_utf8_lossy(&line), router, &self.stats);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect {
        known: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl MilestoneRouter for Collect {
        fn route(&self, entry: &MilestoneEntry) -> bool {
            self.seen.lock().unwrap().push(entry.summary());
            self.known.contains(&entry.name())
        }
    }

    #[test]
    fn test_parse_fields_and_escaped_colon() {
        let entry =
            MilestoneEntry::parse("name=Alice:milestone=reached 10::30:xl=7\n").unwrap();
        assert_eq!(entry.name(), "Alice");
        assert_eq!(entry.get("milestone"), Some("reached 10:30"));
        assert_eq!(entry.get("xl"), Some("7"));
        assert_eq!(entry.summary(), "reached 10:30");
    }

    #[test]
    fn test_parse_rejects_malformed_and_nameless() {
        assert_eq!(MilestoneEntry::parse("   "), Err(MilestoneError::Empty));
        assert_eq!(
            MilestoneEntry::parse("name=Alice:garbage"),
            Err(MilestoneError::MalformedField("garbage".into()))
        );
        assert_eq!(
            MilestoneEntry::parse("=x:name=Alice"),
            Err(MilestoneError::MalformedField("=x".into()))
        );
        assert_eq!(MilestoneEntry::parse("xl=7:type=death"), Err(MilestoneError::NoName));
    }

    #[test]
    fn test_ingest_counts_each_outcome() {
        let router = Collect {
            known: vec!["Alice"],
            ..Default::default()
        };
        let stats = IngestStats::default();
        ingest_milestone("name=Alice:milestone=won", &router, &stats);
        ingest_milestone("name=Bob:milestone=died", &router, &stats);
        ingest_milestone("not an xlog line", &router, &stats);
        ingest_milestone("", &router, &stats);

        assert_eq!(stats.routed(), 1);
        assert_eq!(stats.unattributed(), 1);
        assert_eq!(stats.malformed(), 1);
        assert_eq!(stats.dropped(), 2);
    }

    #[tokio::test]
    async fn test_poll_reads_only_appended_complete_lines() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milestones");
        std::fs::write(&path, "name=Alice:milestone=before start\n").unwrap();

        let router = Collect {
            known: vec!["Alice"],
            ..Default::default()
        };
        let mut tail = MilestoneTail::new(&path, Duration::from_millis(10));
        tail.poll(&router).await.unwrap(); // positions at EOF

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "name=Alice:milestone=one\nname=Alice:milest").unwrap();
        file.flush().unwrap();
        tail.poll(&router).await.unwrap();
        assert_eq!(*router.seen.lock().unwrap(), ["one"]);

        write!(file, "one=two\n").unwrap();
        file.flush().unwrap();
        tail.poll(&router).await.unwrap();
        assert_eq!(router.seen.lock().unwrap().len(), 2);
        assert_eq!(tail.stats().routed(), 2);
        assert_eq!(tail.stats().malformed(), 0);
    }

    #[tokio::test]
    async fn test_poll_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let router = Collect::default();
        let mut tail = MilestoneTail::new(dir.path().join("absent"), Duration::from_secs(1));
        assert!(tail.poll(&router).await.is_ok());
    }
}
