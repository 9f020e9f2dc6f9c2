//! The status file: one line per running game, rewritten on an interval
//! for tools outside the server.
//!
//! ```text
//! username#game_id#milestone#0x0#idle_secs#spectators
//! ```
//!
//! Each rewrite goes to a sibling file that is then renamed over the
//! target, so a reader never sees half a listing.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tilehost_process::ProcessState;
use tilehost_session::{SessionRegistry, SessionSnapshot};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodically rewrites the status file from the registry.
pub struct StatusFile {
    path: PathBuf,
    interval: Duration,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs until `shutdown` flips to `true`, then writes one last
    /// listing so the file does not outlive the games it names.
    pub async fn run(self, registry: Arc<SessionRegistry>, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "status file updates started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.update(&registry).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.update(&registry).await;
        info!(path = %self.path.display(), "status file updates stopped");
    }

    async fn update(&self, registry: &SessionRegistry) {
        if let Err(e) = self.write(&registry.snapshot(), Instant::now()).await {
            warn!(path = %self.path.display(), error = %e, "status file not updated");
        }
    }

    /// Replaces the file with the listing for `snapshots` as of `now`.
    pub async fn write(&self, snapshots: &[SessionSnapshot], now: Instant) -> std::io::Result<()> {
        let listing = render(snapshots, now);
        let staging = staging_path(&self.path);
        tokio::fs::write(&staging, listing.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }
        debug!(path = %self.path.display(), bytes = listing.len(), "status file written");
        Ok(())
    }
}

/// One line per running game, in snapshot order. Games still starting or
/// already exited are left out.
pub fn render(snapshots: &[SessionSnapshot], now: Instant) -> String {
    snapshots
        .iter()
        .filter(|s| s.process_state.is_some_and(ProcessState::is_running))
        .map(|s| {
            format!(
                "{}#{}#{}#0x0#{}#{}\n",
                s.username,
                s.game_id,
                field(s.milestone.as_deref().unwrap_or("")),
                s.idle_for(now).as_secs(),
                s.spectators
            )
        })
        .collect()
}

/// Keeps free text from breaking the line format.
fn field(text: &str) -> String {
    text.replace(['#', '\n', '\r'], " ")
}

/// `<name>.tmp` next to `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use tilehost_process::ViewerId;
    use tilehost_session::{Attachment, SessionId};

    use super::*;

    fn snap(name: &str, state: Option<ProcessState>, idle: u64, milestone: Option<&str>, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            id: SessionId::from(format!("id-{name}")),
            username: name.to_string(),
            game_id: "dcss-gnollcrawl".into(),
            created_at: now - Duration::from_secs(1000),
            attachment: Attachment::Attached {
                connection: ViewerId(1),
            },
            last_input: now - Duration::from_secs(idle),
            last_seen: now,
            process_state: state,
            spectators: 2,
            milestone: milestone.map(str::to_string),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_running_games_only() {
        tokio::time::advance(Duration::from_secs(2000)).await;
        let now = Instant::now();
        let snaps = [
            snap("Alice", Some(ProcessState::Running), 42, Some("found #3 rune"), now),
            snap("Bob", None, 0, None, now),
            snap("Carol", Some(ProcessState::ExitedClean), 0, None, now),
            snap("Dave", Some(ProcessState::Running), 0, None, now),
        ];
        assert_eq!(
            render(&snaps, now),
            "Alice#dcss-gnollcrawl#found  3 rune#0x0#42#2\nDave#dcss-gnollcrawl##0x0#0#2\n"
        );
    }

    #[tokio::test]
    async fn test_write_replaces_file_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, "stale#line\n").unwrap();
        let status = StatusFile::new(&path, Duration::from_secs(5));

        status.write(&[], Instant::now()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_write_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("nope/status"), Duration::from_secs(5));
        assert!(status.write(&[], Instant::now()).await.is_err());
    }

    #[test]
    fn test_staging_path_is_sibling() {
        assert_eq!(
            staging_path(Path::new("/home/crawl/status/status")),
            PathBuf::from("/home/crawl/status/status.tmp")
        );
    }
}
