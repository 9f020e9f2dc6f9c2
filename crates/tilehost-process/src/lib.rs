//! Game process supervision for Tilehost.
//!
//! One game process per session, each owned by its own actor task:
//!
//! ```text
//! ProcessSupervisor::spawn ──▶ ProcessHandle ──commands──▶ process actor
//!                                    ▲                      │  │  │
//!                                    └──── watch(state) ────┘  │  └── ttyrec
//!                                                              ▼
//!                                              viewers (player, spectators)
//! ```
//!
//! The actor relays bytes between the game's socket and the attached
//! viewers, records the output, and runs termination sequences. The
//! lifecycle is observable as a [`ProcessState`] through the handle.

mod actor;
mod error;
mod launch;
mod state;
mod supervisor;

pub use actor::ProcessHandle;
pub use error::ProcessError;
pub use launch::{LaunchPlan, LaunchRequest, MAX_SOCKET_PATH};
pub use state::{
    ProcessExit, ProcessInfo, ProcessState, SupervisorConfig, TerminationOutcome,
    TerminationReason, ViewerEvent, ViewerId, ViewerRole, ViewerSender,
};
pub use supervisor::ProcessSupervisor;
