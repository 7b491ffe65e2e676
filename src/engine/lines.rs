//! Chunk-to-line reassembly for child process streams.

/// Buffers raw stream chunks and yields complete lines.
///
/// Works on bytes so a multi-byte UTF-8 sequence split across two reads is never
/// decoded in halves. Lines are returned without their `\n`; everything else
/// (including a trailing `\r`) is kept.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Remaining unterminated content once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Decodes raw chunks to text, carrying an incomplete trailing UTF-8 sequence
/// over to the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Chunk {
    pending: Vec<u8>,
}

impl Utf8Chunk {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.pending.len());
        let mut consumed = 0;
        for piece in self.pending.utf8_chunks() {
            text.push_str(piece.valid());
            consumed += piece.valid().len();
            let invalid = piece.invalid();
            if invalid.is_empty() {
                continue;
            }
            // Only an unfinished sequence at the very end is worth waiting for.
            if consumed + invalid.len() == self.pending.len() && is_truncated(invalid) {
                break;
            }
            text.push(char::REPLACEMENT_CHARACTER);
            consumed += invalid.len();
        }
        self.pending.drain(..consumed);
        text
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// A prefix of a valid multi-byte sequence, as opposed to bytes no sequence starts with.
fn is_truncated(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_err_and(|e| e.error_len().is_none())
}
