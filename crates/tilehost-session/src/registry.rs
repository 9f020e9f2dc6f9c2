//! The session registry: admission control and lookup.
//!
//! Admission is decided under one lock so that the capacity check, the
//! one-game-per-player rule, and the insert are a single atomic step.
//! Two connections racing for the last slot, or for the same detached
//! game, cannot both win.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tilehost_config::{GameDefinition, Username};
use tilehost_process::ViewerId;
use tilehost_record::{MilestoneEntry, MilestoneRouter};
use tracing::{debug, info};

use crate::{Session, SessionError, SessionId, SessionSnapshot};

/// How `admit` satisfied the request.
#[derive(Debug, Clone)]
pub enum Admission {
    /// A fresh session. Its game has not been started yet.
    New(Arc<Session>),
    /// The player's detached game, now attached to the new connection.
    Resumed(Arc<Session>),
}

impl Admission {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Self::New(s) | Self::Resumed(s) => s,
        }
    }

    pub fn is_resumed(&self) -> bool {
        matches!(self, Self::Resumed(_))
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_user: HashMap<Username, SessionId>,
}

/// All live sessions, indexed by id and by player.
pub struct SessionRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// `capacity` is the most sessions that may exist at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits `username` to play `game` on `connection`.
    ///
    /// A player with a detached, still-running session of the same game
    /// gets it back. A player whose previous game has already exited gets
    /// a fresh session in its place.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyPlaying`] if the player's session is
    ///   attached elsewhere or runs a different game.
    /// - [`SessionError::CapacityExceeded`] if a new session would exceed
    ///   the limit.
    pub fn admit(
        &self,
        username: &Username,
        game: &Arc<GameDefinition>,
        connection: ViewerId,
    ) -> Result<Admission, SessionError> {
        let mut inner = self.lock();

        if let Some(existing) = inner
            .by_user
            .get(username)
            .and_then(|id| inner.sessions.get(id))
            .cloned()
        {
            let exited = existing.process_state().is_some_and(|s| !s.is_running());
            if exited {
                debug!(session_id = %existing.id(), %username, "replacing finished session");
                inner.sessions.remove(existing.id());
                inner.by_user.remove(username);
            } else if existing.game().id != game.id {
                return Err(SessionError::AlreadyPlaying(username.to_string()));
            } else if existing.try_attach(connection) {
                info!(session_id = %existing.id(), %username, game = %game.id, "session resumed");
                return Ok(Admission::Resumed(existing));
            } else {
                return Err(SessionError::AlreadyPlaying(username.to_string()));
            }
        }

        if inner.sessions.len() >= self.capacity {
            return Err(SessionError::CapacityExceeded {
                limit: self.capacity,
            });
        }

        let id = loop {
            let candidate = SessionId::from(generate_id());
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(Session::new(
            id.clone(),
            username.clone(),
            Arc::clone(game),
            connection,
        ));
        inner.sessions.insert(id.clone(), Arc::clone(&session));
        inner.by_user.insert(username.clone(), id.clone());

        info!(
            session_id = %id,
            %username,
            game = %game.id,
            sessions = inner.sessions.len(),
            "session admitted"
        );
        Ok(Admission::New(session))
    }

    /// # Errors
    /// [`SessionError::NotFound`] for an unknown id.
    pub fn lookup(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn find_by_username(&self, username: &str) -> Option<Arc<Session>> {
        let inner = self.lock();
        inner
            .by_user
            .get(username)
            .and_then(|id| inner.sessions.get(id))
            .cloned()
    }

    /// Drops a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let session = inner.sessions.remove(id)?;
        // The by-user slot may already point at a replacement.
        if inner.by_user.get(session.username()) == Some(id) {
            inner.by_user.remove(session.username());
        }
        debug!(session_id = %id, username = %session.username(), "session removed");
        Some(session)
    }

    /// Every session, for sweeps and shutdown.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Point-in-time copies of every session, sorted by username.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snaps: Vec<_> = self.sessions().iter().map(|s| s.snapshot()).collect();
        snaps.sort_by(|a, b| a.username.cmp(&b.username));
        snaps
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation leaves both maps consistent before it can panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MilestoneRouter for SessionRegistry {
    fn route(&self, entry: &MilestoneEntry) -> bool {
        match self.find_by_username(entry.name()) {
            Some(session) => {
                session.set_milestone(entry.summary());
                true
            }
            None => false,
        }
    }
}

/// Generates a random 32-character hex string (128 bits of entropy).
pub(crate) fn generate_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    hex(&bytes)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use tilehost_config::UsernamePolicy;

    use super::*;

    fn game(id: &str) -> Arc<GameDefinition> {
        Arc::new(GameDefinition {
            id: id.into(),
            name: id.into(),
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

    fn user(name: &str) -> Username {
        UsernamePolicy::default().parse(name).unwrap()
    }

    #[test]
    fn test_admit_new_session_is_attached_and_indexed() {
        let reg = SessionRegistry::new(10);
        let admission = reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();
        assert!(!admission.is_resumed());

        let session = admission.session();
        assert_eq!(session.id().as_str().len(), 32);
        assert!(session.is_attached());
        assert!(Arc::ptr_eq(&reg.lookup(session.id()).unwrap(), session));
        assert!(reg.find_by_username("Alice").is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_find_by_username_exact_name_only() {
        let reg = SessionRegistry::new(10);
        reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();
        reg.admit(&user("Bob"), &game("dcss"), ViewerId(2)).unwrap();

        assert_eq!(reg.find_by_username("Bob").unwrap().username().as_str(), "Bob");
        assert!(reg.find_by_username("alice").is_none());
        assert!(reg.find_by_username("Ali").is_none());
    }

    #[test]
    fn test_admit_over_capacity_rejected_then_admitted_after_remove() {
        let reg = SessionRegistry::new(3);
        let g = game("dcss");
        let mut ids = Vec::new();
        for (i, name) in ["a1", "a2", "a3"].iter().enumerate() {
            let a = reg.admit(&user(name), &g, ViewerId(i as u64)).unwrap();
            ids.push(a.session().id().clone());
        }

        let err = reg.admit(&user("a4"), &g, ViewerId(9)).unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded { limit: 3 }));
        assert_eq!(reg.len(), 3);

        reg.remove(&ids[0]);
        assert!(reg.admit(&user("a4"), &g, ViewerId(9)).is_ok());
    }

    #[test]
    fn test_admit_attached_player_is_already_playing() {
        let reg = SessionRegistry::new(10);
        reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();
        let err = reg.admit(&user("Alice"), &game("dcss"), ViewerId(2)).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyPlaying(name) if name == "Alice"));
    }

    #[test]
    fn test_admit_detached_same_game_resumes() {
        let reg = SessionRegistry::new(10);
        let first = reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();
        first.session().detach(ViewerId(1));

        let again = reg.admit(&user("Alice"), &game("dcss"), ViewerId(2)).unwrap();
        assert!(again.is_resumed());
        assert!(Arc::ptr_eq(again.session(), first.session()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_admit_detached_other_game_is_already_playing() {
        let reg = SessionRegistry::new(10);
        let first = reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();
        first.session().detach(ViewerId(1));
        let err = reg.admit(&user("Alice"), &game("sprint"), ViewerId(2)).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyPlaying(_)));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let reg = SessionRegistry::new(10);
        let a = reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();
        let id = a.session().id().clone();
        assert!(reg.remove(&id).is_some());
        assert!(reg.remove(&id).is_none());
        assert!(matches!(reg.lookup(&id), Err(SessionError::NotFound(_))));
        assert!(reg.find_by_username("Alice").is_none());
    }

    #[test]
    fn test_route_sets_milestone_for_known_player_only() {
        let reg = SessionRegistry::new(10);
        reg.admit(&user("Alice"), &game("dcss"), ViewerId(1)).unwrap();

        let alice = MilestoneEntry::parse("name=Alice:milestone=entered the Lair.").unwrap();
        let bob = MilestoneEntry::parse("name=Bob:milestone=died.").unwrap();
        assert!(reg.route(&alice));
        assert!(!reg.route(&bob));

        let snap = reg.snapshot();
        assert_eq!(snap[0].milestone.as_deref(), Some("entered the Lair."));
    }

    #[test]
    fn test_snapshot_sorted_by_username() {
        let reg = SessionRegistry::new(10);
        reg.admit(&user("zed"), &game("dcss"), ViewerId(1)).unwrap();
        reg.admit(&user("Alice"), &game("dcss"), ViewerId(2)).unwrap();
        let names: Vec<_> = reg.snapshot().into_iter().map(|s| s.username).collect();
        assert_eq!(names, ["Alice", "zed"]);
    }
}
