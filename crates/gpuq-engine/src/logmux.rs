/// Demultiplexer for the engine's attached log stream.
///
/// Containers started without a TTY produce a framed stream: an 8-byte header
/// `[stream_type, 0, 0, 0, len_be_u32]` followed by `len` payload bytes, with
/// stdout and stderr interleaved frame by frame. TTY containers produce a raw
/// byte stream. The mode is sniffed from the first chunk and held for the
/// stream's lifetime.
///
/// `push` accepts arbitrary chunk boundaries (frames and lines both split
/// across HTTP chunks) and returns the complete, trimmed lines that became
/// available.
#[derive(Debug, Default)]
pub struct LogDemux {
    mode: Mode,
    /// Unconsumed framed bytes (header + partial payloads).
    frame_buf: Vec<u8>,
    /// Payload bytes of the line currently being assembled.
    line_buf: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum Mode {
    #[default]
    Unknown,
    Framed,
    Raw,
}

impl LogDemux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.mode == Mode::Unknown && !chunk.is_empty() {
            // Stream type byte is 0 (stdin), 1 (stdout) or 2 (stderr), and the
            // three padding bytes are zero. Printable text never matches.
            self.mode = if chunk[0] <= 2 && chunk.len() >= 4 && chunk[1..4] == [0, 0, 0] {
                Mode::Framed
            } else {
                Mode::Raw
            };
        }

        match self.mode {
            Mode::Framed => self.push_framed(chunk),
            _ => self.push_payload(chunk),
        }
    }

    /// Flush the trailing unterminated line, if any. Call after the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        // A truncated final frame's payload is still worker output.
        if self.mode == Mode::Framed && self.frame_buf.len() > 8 {
            let tail: Vec<u8> = self.frame_buf.split_off(8);
            self.line_buf.extend_from_slice(&tail);
        }
        if self.line_buf.is_empty() {
            return None;
        }
        let line = decode_trimmed(&self.line_buf);
        self.line_buf.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }

    fn push_framed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.frame_buf.extend_from_slice(chunk);
        let mut payload = Vec::new();

        loop {
            if self.frame_buf.len() < 8 {
                break;
            }
            let len = u32::from_be_bytes([
                self.frame_buf[4],
                self.frame_buf[5],
                self.frame_buf[6],
                self.frame_buf[7],
            ]) as usize;
            if self.frame_buf.len() < 8 + len {
                break;
            }
            payload.extend_from_slice(&self.frame_buf[8..8 + len]);
            self.frame_buf.drain(..8 + len);
        }

        self.push_payload(&payload)
    }

    fn push_payload(&mut self, payload: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in payload {
            if b == b'\n' {
                let line = decode_trimmed(&self.line_buf);
                self.line_buf.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.line_buf.push(b);
            }
        }
        lines
    }
}

fn decode_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}
