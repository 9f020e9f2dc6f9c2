//! Error types for the recorder.

use std::path::PathBuf;

/// Errors raised by the ttyrec writer.
///
/// A recording error never ends a session. The supervisor logs it and
/// carries on without a transcript.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The recording file could not be created. `create_new` semantics:
    /// an existing file is never reopened by a second writer.
    #[error("cannot create recording {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A write or flush failed.
    #[error("recording write failed: {0}")]
    Write(#[from] std::io::Error),

    /// A frame longer than the 32-bit length field allows.
    #[error("frame of {0} bytes exceeds the ttyrec length field")]
    FrameTooLarge(usize),

    /// A recording ended in the middle of a frame.
    #[error("truncated ttyrec frame at byte {0}")]
    Truncated(usize),
}

/// Why a milestone line was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MilestoneError {
    #[error("empty line")]
    Empty,

    /// A `:`-separated field without `=`, or with an empty key.
    #[error("malformed field `{0}`")]
    MalformedField(String),

    /// The entry has no `name` field, so it cannot be attributed.
    #[error("entry has no name field")]
    NoName,
}
