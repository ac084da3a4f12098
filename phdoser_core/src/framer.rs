//! Carriage-return line framing for the probe byte stream.
//!
//! Bytes are buffered undecoded and each complete line is decoded on its own
//! (invalid UTF-8 becomes U+FFFD), so how the stream is chunked never changes
//! the lines produced.

/// Largest partial line kept between reads before the buffer is dumped.
pub const MAX_BUFFER_LENGTH: usize = 100;

const DELIMITER: u8 = b'\r';

/// Result of one `push`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Framed {
    /// Complete, trimmed, non-empty lines in arrival order.
    pub lines: Vec<String>,
    /// The buffer exceeded its limit and everything buffered was discarded.
    pub overflowed: bool,
}

#[derive(Debug, Clone)]
pub struct LineFramer {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFER_LENGTH)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(4096)),
            limit,
        }
    }

    /// Append `bytes` and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Framed {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit {
            tracing::debug!(
                target: "phdoser::probe",
                len = self.buf.len(),
                "buffer exceeded max length; dumping"
            );
            self.buf.clear();
            return Framed {
                lines: Vec::new(),
                overflowed: true,
            };
        }

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(off) = self.buf[start..].iter().position(|&b| b == DELIMITER) {
            let raw = &self.buf[start..start + off];
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            start += off + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > self.limit / 2 {
            tracing::debug!(
                target: "phdoser::probe",
                len = self.buf.len(),
                "buffer growing large; possible missing terminators"
            );
        }
        Framed {
            lines,
            overflowed: false,
        }
    }

    /// Unterminated bytes carried to the next `push`.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
