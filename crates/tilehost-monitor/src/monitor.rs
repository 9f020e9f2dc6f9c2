//! The idle and connection timeout monitor.
//!
//! Each sweep copies the registry into snapshots, decides what to do
//! from the copies alone ([`plan`]), then acts through process handles
//! and session signals. It never edits session state itself.
//!
//! Three timers, kept apart:
//!
//! | Timer                | Clock          | Action                                  |
//! |----------------------|----------------|-----------------------------------------|
//! | `max_idle_time`      | last input     | graceful termination of the game        |
//! | `connection_timeout` | last traffic   | close the connection, game keeps going  |
//! | `kill_timeout`       | hangup signal  | forced kill (inside the process actor)  |

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tilehost_config::ServerSettings;
use tilehost_process::{TerminationOutcome, TerminationReason};
use tilehost_session::{SessionId, SessionRegistry, SessionSnapshot};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::SweepSchedule;

/// Capacity of the event broadcast. Slow subscribers miss old events.
const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between sweeps. Zero disables the monitor.
    pub interval: Duration,
    /// Input silence after which a game is ended.
    pub max_idle_time: Duration,
    /// Traffic silence after which a connection is closed.
    pub connection_timeout: Duration,
    /// Extra random delay before the first sweep.
    pub initial_jitter: Duration,
}

impl MonitorConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            interval: settings.monitor_interval(),
            max_idle_time: settings.max_idle_time(),
            connection_timeout: settings.connection_timeout(),
            initial_jitter: Duration::from_millis(500),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something the monitor did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A graceful termination was started for an idle game.
    IdleTermination {
        session_id: SessionId,
        username: String,
        idle_for: Duration,
    },
    /// A game ignored the hangup and was killed after the kill timeout.
    ForcedTermination {
        session_id: SessionId,
        username: String,
    },
    /// A silent connection was asked to close. The game was left alone.
    ConnectionClosed {
        session_id: SessionId,
        username: String,
        silent_for: Duration,
    },
    /// A session whose game had already exited was removed.
    Reaped {
        session_id: SessionId,
        username: String,
    },
}

/// Running totals.
#[derive(Debug, Default)]
pub struct MonitorStats {
    sweeps: AtomicU64,
    idle_terminations: AtomicU64,
    forced_terminations: AtomicU64,
    connections_closed: AtomicU64,
    reaped: AtomicU64,
}

impl MonitorStats {
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn idle_terminations(&self) -> u64 {
        self.idle_terminations.load(Ordering::Relaxed)
    }

    pub fn forced_terminations(&self) -> u64 {
        self.forced_terminations.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// One decision taken from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    TerminateIdle { session_id: SessionId, idle_for: Duration },
    CloseConnection { session_id: SessionId, silent_for: Duration },
    Reap { session_id: SessionId },
}

/// Decides what to do with each session, given the time `now`.
///
/// - Starting sessions (no process yet) are only checked for silence.
/// - Exited games are reaped.
/// - Running games idle past `max_idle_time` are terminated, unless a
///   termination is already `in_flight`.
/// - Attached connections silent past `connection_timeout` are closed.
///   Detached games are never touched by this rule.
pub fn plan(
    snapshots: &[SessionSnapshot],
    now: Instant,
    config: &MonitorConfig,
    in_flight: &HashSet<SessionId>,
) -> Vec<Action> {
    let mut actions = Vec::new();
    for snap in snapshots {
        match snap.process_state {
            Some(state) if !state.is_running() => {
                actions.push(Action::Reap {
                    session_id: snap.id.clone(),
                });
                continue;
            }
            Some(_) => {
                let idle_for = snap.idle_for(now);
                if idle_for > config.max_idle_time && !in_flight.contains(&snap.id) {
                    actions.push(Action::TerminateIdle {
                        session_id: snap.id.clone(),
                        idle_for,
                    });
                    continue;
                }
            }
            None => {}
        }

        let silent_for = now.saturating_duration_since(snap.last_seen);
        if snap.is_attached() && silent_for > config.connection_timeout {
            actions.push(Action::CloseConnection {
                session_id: snap.id.clone(),
                silent_for,
            });
        }
    }
    actions
}

// ---------------------------------------------------------------------------
// IdleMonitor
// ---------------------------------------------------------------------------

/// Sweeps the registry on a fixed interval.
pub struct IdleMonitor {
    config: MonitorConfig,
    events: broadcast::Sender<MonitorEvent>,
    stats: Arc<MonitorStats>,
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
}

impl IdleMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            events,
            stats: Arc::new(MonitorStats::default()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until `shutdown` flips to `true`.
    pub async fn run(self, registry: Arc<SessionRegistry>, mut shutdown: watch::Receiver<bool>) {
        let mut schedule = SweepSchedule::new(self.config.interval, self.config.initial_jitter);
        if schedule.is_disabled() {
            info!("idle monitor disabled");
        } else {
            info!(
                interval_secs = self.config.interval.as_secs(),
                max_idle_secs = self.config.max_idle_time.as_secs(),
                connection_timeout_secs = self.config.connection_timeout.as_secs(),
                "idle monitor started"
            );
        }

        loop {
            tokio::select! {
                due = schedule.wait_for_sweep() => {
                    let actions = self.sweep(&registry);
                    schedule.record_sweep_end();
                    trace!(
                        sweep = due.sweep,
                        overrun = due.overrun,
                        skipped = due.skipped,
                        actions = actions.len(),
                        "monitor sweep done"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let metrics = schedule.metrics();
        info!(
            sweeps = metrics.total_sweeps,
            overruns = metrics.total_overruns,
            skipped = metrics.total_skipped,
            max_sweep_ms = metrics.max_sweep_time.as_millis() as u64,
            "idle monitor stopped"
        );
    }

    /// Runs one sweep. Terminations continue in background tasks; the
    /// sweep itself never waits on a game.
    pub fn sweep(&self, registry: &Arc<SessionRegistry>) -> Vec<Action> {
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        let snapshots = registry.snapshot();
        let now = Instant::now();
        let actions = {
            let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            plan(&snapshots, now, &self.config, &in_flight)
        };

        for action in &actions {
            match action {
                Action::Reap { session_id } => self.reap(registry, session_id),
                Action::TerminateIdle {
                    session_id,
                    idle_for,
                } => self.terminate_idle(registry, session_id, *idle_for),
                Action::CloseConnection {
                    session_id,
                    silent_for,
                } => self.close_connection(registry, session_id, *silent_for),
            }
        }
        if !actions.is_empty() {
            debug!(sessions = snapshots.len(), actions = actions.len(), "monitor sweep");
        }
        actions
    }

    fn reap(&self, registry: &SessionRegistry, session_id: &SessionId) {
        let Some(session) = registry.remove(session_id) else {
            return;
        };
        info!(%session_id, username = %session.username(), "finished session reaped");
        self.stats.reaped.fetch_add(1, Ordering::Relaxed);
        self.emit(MonitorEvent::Reaped {
            session_id: session_id.clone(),
            username: session.username().to_string(),
        });
    }

    fn close_connection(&self, registry: &SessionRegistry, session_id: &SessionId, silent_for: Duration) {
        let Ok(session) = registry.lookup(session_id) else {
            return;
        };
        info!(
            %session_id,
            username = %session.username(),
            silent_secs = silent_for.as_secs(),
            "connection timed out; closing it and leaving the game running"
        );
        session.request_disconnect();
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.emit(MonitorEvent::ConnectionClosed {
            session_id: session_id.clone(),
            username: session.username().to_string(),
            silent_for,
        });
    }

    fn terminate_idle(&self, registry: &SessionRegistry, session_id: &SessionId, idle_for: Duration) {
        let Ok(session) = registry.lookup(session_id) else {
            return;
        };
        let Some(handle) = session.process().cloned() else {
            return;
        };
        let username = session.username().to_string();
        info!(
            %session_id,
            %username,
            idle_secs = idle_for.as_secs(),
            "session idle; terminating game"
        );
        self.stats.idle_terminations.fetch_add(1, Ordering::Relaxed);
        self.emit(MonitorEvent::IdleTermination {
            session_id: session_id.clone(),
            username: username.clone(),
            idle_for,
        });

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.clone());

        let in_flight = Arc::clone(&self.in_flight);
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let outcome = handle.terminate(true, TerminationReason::Idle).await;
            if outcome == TerminationOutcome::Forced {
                warn!(%session_id, %username, "idle game ignored hangup and was killed");
                stats.forced_terminations.fetch_add(1, Ordering::Relaxed);
                let _ = events.send(MonitorEvent::ForcedTermination {
                    session_id: session_id.clone(),
                    username,
                });
            }
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&session_id);
        });
    }

    fn emit(&self, event: MonitorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
