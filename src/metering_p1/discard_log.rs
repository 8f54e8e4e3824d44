use log::warn;

/// Number of discarded bytes collected before the log is flushed.
pub const DISCARD_LOG_BYTES: usize = 64;

pub type DiscardSink = Box<dyn FnMut(&str)>;

/// Hex dump of bytes thrown away during error recovery.
pub struct DiscardLog {
    buffer: [u8; DISCARD_LOG_BYTES * 2],
    len: usize,
    sink: Option<DiscardSink>,
}

impl DiscardLog {
    pub fn new() -> Self {
        return DiscardLog {
            buffer: [0; DISCARD_LOG_BYTES * 2],
            len: 0,
            sink: None,
        };
    }

    /// Flushed dumps are handed to `sink` in addition to the log output.
    pub fn set_sink(&mut self, sink: DiscardSink) {
        self.sink = Some(sink);
    }

    pub fn add_byte(&mut self, byte: u8) {
        if hex::encode_to_slice([byte], &mut self.buffer[self.len..self.len + 2]).is_ok() {
            self.len += 2;
        }
        if self.len == self.buffer.len() {
            self.flush();
        }
    }

    pub fn is_empty(&self) -> bool {
        return self.len == 0;
    }

    pub fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(text) = std::str::from_utf8(&self.buffer[..self.len]) {
            warn!("Discarding: {}", text);
            if let Some(sink) = self.sink.as_mut() {
                sink(text);
            }
        }
        self.len = 0;
    }
}
