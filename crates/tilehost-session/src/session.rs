//! A single player session and its attachment state.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tilehost_config::{GameDefinition, Username};
use tilehost_process::{ProcessHandle, ProcessState, ViewerId};
use tokio::sync::watch;
use tokio::time::Instant;

/// Opaque session identifier: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who holds the player's seat.
///
/// ```text
/// Attached ──connection closes──▶ Detached ──player logs in again──▶ Attached
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// A live connection is driving the game.
    Attached { connection: ViewerId },
    /// The game keeps running with nobody at the keyboard.
    Detached { since: Instant },
}

/// Mutable timing and attachment data, guarded together.
#[derive(Debug, Clone, Copy)]
struct Activity {
    attachment: Attachment,
    last_input: Instant,
    last_seen: Instant,
}

/// One player's game.
///
/// Shared as `Arc<Session>` between the registry, the player's connection
/// task, and the monitor. The game process is set once, after it has
/// started; until then the session is "starting" and invisible to the
/// monitor.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    username: Username,
    game: Arc<GameDefinition>,
    created_at: Instant,
    activity: Mutex<Activity>,
    process: OnceLock<ProcessHandle>,
    spectators: AtomicUsize,
    milestone: Mutex<Option<String>>,
    kick: watch::Sender<u64>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        username: Username,
        game: Arc<GameDefinition>,
        connection: ViewerId,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            username,
            game,
            created_at: now,
            activity: Mutex::new(Activity {
                attachment: Attachment::Attached { connection },
                last_input: now,
                last_seen: now,
            }),
            process: OnceLock::new(),
            spectators: AtomicUsize::new(0),
            milestone: Mutex::new(None),
            kick: watch::Sender::new(0),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    pub fn game(&self) -> &Arc<GameDefinition> {
        &self.game
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn attachment(&self) -> Attachment {
        self.activity().attachment
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.attachment(), Attachment::Attached { .. })
    }

    /// Last time the player sent game input.
    pub fn last_input(&self) -> Instant {
        self.activity().last_input
    }

    /// Last time anything at all arrived from the player's connection.
    pub fn last_seen(&self) -> Instant {
        self.activity().last_seen
    }

    /// Records game input. Input counts as traffic too.
    pub fn touch_input(&self) {
        let now = Instant::now();
        let mut activity = self.activity();
        activity.last_input = now;
        activity.last_seen = now;
    }

    /// Records non-input traffic such as heartbeats.
    pub fn touch_seen(&self) {
        self.activity().last_seen = Instant::now();
    }

    /// The game process, once it has started.
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.get()
    }

    /// `None` while the game is still starting.
    pub fn process_state(&self) -> Option<ProcessState> {
        self.process.get().map(ProcessHandle::state)
    }

    /// Installs the game process. Returns `false` if one was already set.
    pub fn set_process(&self, handle: ProcessHandle) -> bool {
        self.process.set(handle).is_ok()
    }

    pub fn spectators(&self) -> usize {
        self.spectators.load(Ordering::Relaxed)
    }

    pub fn add_spectator(&self) {
        self.spectators.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_spectator(&self) {
        // Saturating: a double remove must not wrap.
        let _ = self
            .spectators
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Summary of the most recent milestone, if any.
    pub fn milestone(&self) -> Option<String> {
        self.milestone.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_milestone(&self, summary: String) {
        *self.milestone.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary);
    }

    /// Asks the attached connection to close without touching the game.
    pub fn request_disconnect(&self) {
        self.kick.send_modify(|n| *n += 1);
    }

    /// Fires whenever [`request_disconnect`](Self::request_disconnect) is
    /// called after subscribing.
    pub fn disconnect_requests(&self) -> watch::Receiver<u64> {
        self.kick.subscribe()
    }

    /// Marks the session detached if `connection` still holds it.
    /// Returns whether anything changed.
    pub fn detach(&self, connection: ViewerId) -> bool {
        let mut activity = self.activity();
        match activity.attachment {
            Attachment::Attached { connection: c } if c == connection => {
                activity.attachment = Attachment::Detached {
                    since: Instant::now(),
                };
                true
            }
            _ => false,
        }
    }

    /// Claims a detached session for `connection`.
    pub(crate) fn try_attach(&self, connection: ViewerId) -> bool {
        let mut activity = self.activity();
        match activity.attachment {
            Attachment::Detached { .. } => {
                let now = Instant::now();
                activity.attachment = Attachment::Attached { connection };
                activity.last_seen = now;
                true
            }
            Attachment::Attached { .. } => false,
        }
    }

    /// A read-only copy of everything the monitor and lobby need.
    pub fn snapshot(&self) -> SessionSnapshot {
        let activity = *self.activity();
        SessionSnapshot {
            id: self.id.clone(),
            username: self.username.as_str().to_string(),
            game_id: self.game.id.clone(),
            created_at: self.created_at,
            attachment: activity.attachment,
            last_input: activity.last_input,
            last_seen: activity.last_seen,
            process_state: self.process_state(),
            spectators: self.spectators(),
            milestone: self.milestone(),
        }
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        // The guarded data is plain timestamps; a poisoned lock is still
        // consistent.
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub username: String,
    pub game_id: String,
    pub created_at: Instant,
    pub attachment: Attachment,
    pub last_input: Instant,
    pub last_seen: Instant,
    /// `None` while the game is starting.
    pub process_state: Option<ProcessState>,
    pub spectators: usize,
    pub milestone: Option<String>,
}

impl SessionSnapshot {
    pub fn is_attached(&self) -> bool {
        matches!(self.attachment, Attachment::Attached { .. })
    }

    /// Time since the last input, as of `now`.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_input)
    }
}

#[cfg(test)]
mod tests {
    use tilehost_config::UsernamePolicy;

    use super::*;

    fn session() -> Session {
        let game = GameDefinition {
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
        };
        Session::new(
            SessionId::from("ab".repeat(16)),
            UsernamePolicy::default().parse("Alice").unwrap(),
            Arc::new(game),
            ViewerId(1),
        )
    }

    #[test]
    fn test_detach_only_by_owning_connection() {
        let s = session();
        assert!(!s.detach(ViewerId(2)));
        assert!(s.is_attached());
        assert!(s.detach(ViewerId(1)));
        assert!(!s.is_attached());
        assert!(!s.detach(ViewerId(1)));
    }

    #[test]
    fn test_try_attach_refuses_attached_session() {
        let s = session();
        assert!(!s.try_attach(ViewerId(2)));
        s.detach(ViewerId(1));
        assert!(s.try_attach(ViewerId(2)));
        assert_eq!(s.attachment(), Attachment::Attached { connection: ViewerId(2) });
    }

    #[test]
    fn test_remove_spectator_saturates() {
        let s = session();
        s.add_spectator();
        s.remove_spectator();
        s.remove_spectator();
        assert_eq!(s.spectators(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_input_moves_both_clocks() {
        let s = session();
        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        s.touch_seen();
        assert!(s.last_seen() > s.last_input());
        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        s.touch_input();
        assert_eq!(s.last_seen(), s.last_input());
        assert_eq!(s.snapshot().idle_for(Instant::now()), std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn test_request_disconnect_wakes_subscriber() {
        let s = session();
        let mut rx = s.disconnect_requests();
        s.request_disconnect();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn test_snapshot_of_starting_session_has_no_process_state() {
        let s = session();
        let snap = s.snapshot();
        assert_eq!(snap.process_state, None);
        assert_eq!(snap.game_id, "dcss-gnollcrawl");
        assert!(snap.is_attached());
    }
}
