//! UTF-8 reassembly for relayed game output.
//!
//! Socket reads split the byte stream at arbitrary points, so a
//! multi-byte character can straddle two reads. [`Utf8Carry`] holds back
//! an incomplete trailing sequence until the next chunk completes it.
//! Bytes that can never become valid UTF-8 are replaced with U+FFFD.

/// Carries an incomplete UTF-8 suffix between chunks.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, prefixed with whatever was held back last time.
    ///
    /// Returns the longest decodable prefix. An incomplete sequence at
    /// the very end is kept for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flushes a held-back suffix, lossily. Call once the stream ends.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
