//! Recording for Tilehost.
//!
//! - [`TtyrecWriter`] appends timestamped terminal frames to one
//!   session's transcript.
//! - [`MilestoneTail`] follows the shared milestone file and hands each
//!   parsed [`MilestoneEntry`] to a [`MilestoneRouter`].

mod error;
mod milestone;
mod ttyrec;

pub use error::{MilestoneError, RecordError};
pub use milestone::{
    ingest_milestone, IngestStats, MilestoneEntry, MilestoneRouter, MilestoneTail,
};
pub use ttyrec::{decode_frames, ttyrec_filename, RecordingStats, TtyrecFrame, TtyrecWriter};
