//! Wire framing for the backend event stream.
//!
//! Events are newline-delimited text blocks separated by a blank line.
//! Lines starting with `:` are heartbeats, `id:` carries the resumption
//! cursor and `data:` carries a JSON payload. Other fields are ignored.

use tracing::{debug, warn};

/// One complete event block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<u64>,
    pub data: Option<String>,
}

impl SseFrame {
    /// Comment-only (or empty) blocks keep the connection alive and carry nothing
    pub fn is_heartbeat(&self) -> bool {
        self.id.is_none() && self.data.is_none()
    }
}

/// Largest event block kept while waiting for its delimiter (1MB)
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Accumulates raw bytes and yields complete blocks.
///
/// An incomplete trailing fragment stays buffered until a later chunk
/// supplies the blank-line delimiter. A fragment that outgrows the limit is
/// dropped along with the rest of its block.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes before this offset are known to hold no delimiter
    scanned: usize,
    limit: usize,
    /// Skipping the remainder of an oversized block
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
            discarding: false,
        }
    }

    /// Append a chunk and return every block it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        // CRLF framing is folded to LF
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        loop {
            // A delimiter may straddle the previous scan boundary
            let from = self.scanned.saturating_sub(1);
            let Some(offset) = find_delimiter(&self.buffer[from..]) else {
                break;
            };
            let end = from + offset;
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                debug!("Skipped the tail of an oversized event");
                continue;
            }
            let text = String::from_utf8_lossy(&block[..end]);
            frames.push(parse_block(&text));
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.limit {
            warn!(
                pending = self.buffer.len(),
                limit = self.limit,
                "Dropping oversized event stream block"
            );
            let ends_line = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if ends_line {
                // Half of a delimiter that the next chunk may complete
                self.buffer.push(b'\n');
            }
            self.scanned = 0;
            self.discarding = true;
        }
        frames
    }

    /// Bytes held back waiting for a delimiter
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Parse a single block (without its trailing blank line)
pub fn parse_block(block: &str) -> SseFrame {
    let mut frame = SseFrame::default();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => match value.trim().parse::<u64>() {
                Ok(id) => frame.id = Some(id),
                Err(_) => debug!(value, "Ignoring non-numeric event id"),
            },
            "data" => match frame.data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => frame.data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    frame
}
