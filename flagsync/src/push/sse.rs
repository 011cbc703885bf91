/// One dispatched server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The `event` field, which defaults to `message`.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Default)]
struct PendingEvent {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

/// Incremental parser for the `text/event-stream` framing.
///
/// Bytes are fed as they arrive from the socket, split at arbitrary points. Lines
/// end with `\n` or `\r\n`, comment lines (`:` prefix, used for keep-alives) are
/// skipped, multiple `data` lines are joined with `\n`, and a blank line
/// dispatches the pending event.
#[derive(Default)]
pub struct EventParser {
    buffer: Vec<u8>,
    pending: PendingEvent,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `chunk` and returns the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.pending.id = Some(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "data" => self.pending.data.push(value.to_string()),
            // retry and unknown fields
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let pending = std::mem::take(&mut self.pending);
        if pending.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            id: pending.id,
            event: pending.event,
            data: pending.data.join("\n"),
        })
    }
}
