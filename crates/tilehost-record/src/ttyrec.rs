//! ttyrec transcripts.
//!
//! A ttyrec file is a sequence of frames. Each frame is a 12-byte header
//! of three little-endian `u32`s (seconds, microseconds, payload length)
//! followed by the payload bytes exactly as the terminal received them.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────┐
//! │ sec: u32 │ usec: u32│ len: u32 │ data: [u8; len]      │
//! └──────────┴──────────┴──────────┴──────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::RecordError;

const HEADER_LEN: usize = 12;

/// Numbered names tried before [`TtyrecWriter::create_in`] gives up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// File name for a new recording: `<user>:<YYYY-mm-dd.HH:MM:SS>.ttyrec`.
pub fn ttyrec_filename(username: &str, started: DateTime<Utc>) -> String {
    numbered_filename(username, started, 0)
}

/// [`ttyrec_filename`] with `-<n>` ahead of the extension when `n > 0`.
fn numbered_filename(username: &str, started: DateTime<Utc>, n: u32) -> String {
    let stamp = started.format("%Y-%m-%d.%H:%M:%S");
    match n {
        0 => format!("{username}:{stamp}.ttyrec"),
        n => format!("{username}:{stamp}-{n}.ttyrec"),
    }
}

async fn open_new(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create_new(true).append(true).open(path).await
}

/// Totals for a finished recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingStats {
    pub frames: u64,
    pub bytes: u64,
}

/// Append-only writer for one session's transcript.
///
/// The file is opened with `create_new`, so two writers can never share a
/// file. The writer is owned by the session's process actor and is never
/// shared.
pub struct TtyrecWriter {
    path: PathBuf,
    out: BufWriter<File>,
    stats: RecordingStats,
}

impl TtyrecWriter {
    /// Creates the recording and writes an initial frame that sizes the
    /// terminal to `term_size` (`(cols, rows)`).
    pub async fn create(path: &Path, term_size: (u16, u16)) -> Result<Self, RecordError> {
        let file = open_new(path).await.map_err(|source| RecordError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        Self::start(path.to_path_buf(), file, term_size).await
    }

    /// Creates `username`'s recording for a game started at `started` in
    /// `dir`. If a recording with that name already exists (two games in
    /// the same second), a numbered name is used instead.
    pub async fn create_in(
        dir: &Path,
        username: &str,
        started: DateTime<Utc>,
        term_size: (u16, u16),
    ) -> Result<Self, RecordError> {
        let mut last = None;
        for n in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(numbered_filename(username, started, n));
            match open_new(&path).await {
                Ok(file) => return Self::start(path, file, term_size).await,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last = Some((path, e)),
                Err(source) => return Err(RecordError::Create { path, source }),
            }
        }
        let (path, source) = last.unwrap_or_else(|| {
            (
                dir.join(ttyrec_filename(username, started)),
                std::io::ErrorKind::AlreadyExists.into(),
            )
        });
        Err(RecordError::Create { path, source })
    }

    async fn start(path: PathBuf, file: File, term_size: (u16, u16)) -> Result<Self, RecordError> {
        let mut writer = Self {
            path,
            out: BufWriter::new(file),
            stats: RecordingStats::default(),
        };
        let (cols, rows) = term_size;
        let resize = format!("\x1b[8;{rows};{cols}t");
        writer.record(resize.as_bytes(), SystemTime::now()).await?;
        tracing::debug!(path = %writer.path.display(), cols, rows, "recording started");
        Ok(writer)
    }

    /// Appends one frame stamped with `at`.
    pub async fn record(&mut self, data: &[u8], at: SystemTime) -> Result<(), RecordError> {
        let len = u32::try_from(data.len()).map_err(|_| RecordError::FrameTooLarge(data.len()))?;
        let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();

        let mut header = [0u8; HEADER_LEN];
        // The format's seconds field is 32 bits wide.
        header[0..4].copy_from_slice(&(since_epoch.as_secs() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&since_epoch.subsec_micros().to_le_bytes());
        header[8..12].copy_from_slice(&len.to_le_bytes());

        self.out.write_all(&header).await?;
        self.out.write_all(data).await?;
        self.stats.frames += 1;
        self.stats.bytes += data.len() as u64;
        Ok(())
    }

    /// Pushes buffered frames to the file.
    pub async fn flush(&mut self) -> Result<(), RecordError> {
        self.out.flush().await?;
        Ok(())
    }

    /// Flushes and closes the recording.
    pub async fn finish(mut self) -> Result<RecordingStats, RecordError> {
        self.out.flush().await?;
        self.out.get_mut().sync_data().await?;
        tracing::debug!(
            path = %self.path.display(),
            frames = self.stats.frames,
            bytes = self.stats.bytes,
            "recording finished"
        );
        Ok(self.stats)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> RecordingStats {
        self.stats
    }
}

/// One decoded ttyrec frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyrecFrame {
    pub sec: u32,
    pub usec: u32,
    pub data: Vec<u8>,
}

/// Decodes a whole ttyrec byte stream.
///
/// # Errors
/// [`RecordError::Truncated`] if the stream ends inside a frame.
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<TtyrecFrame>, RecordError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while !bytes.is_empty() {
        if bytes.len() < HEADER_LEN {
            return Err(RecordError::Truncated(offset));
        }
        let field = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let (sec, usec, len) = (field(0), field(4), field(8) as usize);
        let end = HEADER_LEN + len;
        if bytes.len() < end {
            return Err(RecordError::Truncated(offset));
        }
        frames.push(TtyrecFrame {
            sec,
            usec,
            data: bytes[HEADER_LEN..end].to_vec(),
        });
        bytes = &bytes[end..];
        offset += end;
    }
    Ok(frames)
}
