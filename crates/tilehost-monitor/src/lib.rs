//! Idle and connection timeout monitor for Tilehost.
//!
//! One background task sweeps the session registry on a fixed interval
//! ([`SweepSchedule`]) and:
//!
//! - gracefully terminates games whose player has sent no input for
//!   longer than `max_idle_time` (the process actor escalates to a kill
//!   after `kill_timeout`, reported as [`MonitorEvent::ForcedTermination`]);
//! - closes connections that have been silent for longer than
//!   `connection_timeout`, leaving their games running detached;
//! - removes sessions whose game has already exited.
//!
//! A second, optional task ([`StatusFile`]) rewrites a one-line-per-game
//! listing of running games for tools outside the server.
//!
//! Everything the monitor does is broadcast as a [`MonitorEvent`].

mod monitor;
mod schedule;
mod status;

pub use monitor::{plan, Action, IdleMonitor, MonitorConfig, MonitorEvent, MonitorStats};
pub use schedule::{SweepInfo, SweepMetrics, SweepSchedule};
pub use status::{render as render_status, StatusFile};
