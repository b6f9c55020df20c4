use std::sync::Arc;

use crate::events::Streamer;

/// Line-buffered bridge from raw agent output to text-message events
///
/// Each complete line (newline included) becomes one content event. A
/// trailing partial line is held until more output arrives or [`flush`]
/// is called.
///
/// [`flush`]: StreamWriter::flush
pub struct StreamWriter {
    streamer: Arc<dyn Streamer>,
    run_id: String,
    message_id: String,
    buffer: Vec<u8>,
}

impl StreamWriter {
    pub fn new(streamer: Arc<dyn Streamer>, run_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            streamer,
            run_id: run_id.into(),
            message_id: message_id.into(),
            buffer: Vec::new(),
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.streamer
                .stream_content(&self.run_id, &self.message_id, &String::from_utf8_lossy(&line));
        }
    }

    /// Emit whatever partial line is left
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.streamer
            .stream_content(&self.run_id, &self.message_id, &String::from_utf8_lossy(&rest));
    }
}
