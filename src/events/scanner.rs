//! Incremental scanner turning raw child output into events.
//!
//! The child writes free-form text interleaved with invisible markers. A
//! marker may be split across any number of `write` calls; the scanner keeps
//! the unconsumed tail in a buffer and only searches it when the bracket
//! token shows up in the latest chunk or straddles the previous one.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::codec::{EventMarkerCodec, ERASE_LINE};
use super::error::EventError;
use super::persister::EventSink;
use super::types::Event;

/// Job-wide event counter, shared by every scanner of one job.
#[derive(Debug, Clone, Default)]
pub struct EventCounter(Arc<AtomicU64>);

impl EventCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next counter value. The first call returns 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last value handed out.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

type Output = Box<dyn Write + Send>;

/// Reassembles events from an output stream and hands them to a sink.
pub struct StreamEventScanner<S> {
    codec: EventMarkerCodec,
    sink: S,
    counter: EventCounter,
    buffer: String,
    /// Decoded begin marker whose text has not been emitted yet.
    current: Option<Map<String, Value>>,
    start_line: usize,
    seen_uuids: HashMap<String, u32>,
    pid: Option<u32>,
    log: Option<Output>,
    console: Option<Output>,
    json_mode: bool,
    failure: Option<EventError>,
    closed: bool,
}

impl<S> std::fmt::Debug for StreamEventScanner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEventScanner")
            .field("buffered", &self.buffer.len())
            .field("pending", &self.current.is_some())
            .field("start_line", &self.start_line)
            .field("counter", &self.counter.current())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<S: EventSink> StreamEventScanner<S> {
    /// Scanner with its own counter starting at zero.
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self::with_counter(sink, EventCounter::new())
    }

    /// Scanner drawing counter values from `counter`.
    #[must_use]
    pub fn with_counter(sink: S, counter: EventCounter) -> Self {
        Self {
            codec: EventMarkerCodec::new(),
            sink,
            counter,
            buffer: String::new(),
            current: None,
            start_line: 0,
            seen_uuids: HashMap::new(),
            pid: None,
            log: None,
            console: None,
            json_mode: false,
            failure: None,
            closed: false,
        }
    }

    /// Mirror the human-readable text into `log` (the `stdout` artifact).
    #[must_use]
    pub fn with_log(mut self, log: Output) -> Self {
        self.log = Some(log);
        self
    }

    /// Echo output to a live console.
    #[must_use]
    pub fn with_console(mut self, console: Output) -> Self {
        self.console = Some(console);
        self
    }

    /// Write marker events to the log and console as JSON instead of their
    /// text. Plain lines are written unchanged.
    #[must_use]
    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    /// Record the child's pid on events that do not carry one.
    pub fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    /// Returns true once the sink has rejected an event.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Take the first error returned by the sink, if any.
    pub fn take_failure(&mut self) -> Option<EventError> {
        self.failure.take()
    }

    /// Feed a chunk of decoded output.
    pub fn write(&mut self, data: &str) {
        if self.closed {
            tracing::warn!(bytes = data.len(), "Write to closed scanner ignored");
            return;
        }
        // a token can straddle the previous write by at most len - 1 bytes
        let mut from = self.buffer.len().saturating_sub(ERASE_LINE.len() - 1);
        while !self.buffer.is_char_boundary(from) {
            from -= 1;
        }
        self.buffer.push_str(data);
        let should_search = EventMarkerCodec::has_token(&self.buffer[from..]);

        if should_search {
            while let Some(span) = self.codec.find(&self.buffer) {
                let decoded = match self.codec.decode(&self.buffer[span.payload.clone()]) {
                    Ok(fields) => fields,
                    Err(e) => {
                        tracing::debug!(error = %e, "Undecodable event marker, substituting empty payload");
                        Map::new()
                    }
                };
                let before = self.buffer[..span.start].to_owned();
                let remainder = self.buffer.split_off(span.end);
                self.emit(&before, Some(decoded));
                self.buffer = remainder;
            }
            return;
        }

        if data.contains('\n') && self.current.is_none() {
            if let Some(cut) = self.buffer.rfind('\n') {
                let remainder = self.buffer.split_off(cut + 1);
                let complete = std::mem::replace(&mut self.buffer, remainder);
                self.emit(&complete, None);
            }
        }
    }

    /// Flush buffered text, emit the end-of-stream sentinel and close the log.
    ///
    /// Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.emit(&rest, None);
        }
        self.deliver(Event::eof());
        if let Some(mut log) = self.log.take() {
            if let Err(e) = log.flush() {
                tracing::warn!(error = %e, "Failed to flush stdout log");
            }
        }
        if let Some(console) = self.console.as_mut() {
            let _ = console.flush();
        }
        self.closed = true;
    }

    /// Commit `text` as one or more events and remember `next` as the pending
    /// marker if it names a uuid.
    fn emit(&mut self, text: &str, next: Option<Map<String, Value>>) {
        let template = self.current.take();
        let chunks: Vec<&str> = match template {
            Some(_) => vec![text],
            None if !text.is_empty() => text.split_inclusive('\n').collect(),
            None => Vec::new(),
        };

        for chunk in chunks {
            let mut event = match &template {
                Some(fields) => Event::from_marker(fields.clone()),
                None => Event::verbose(),
            };
            let n_lines = chunk.matches('\n').count();
            event.counter = self.counter.next();
            event.stdout = strip_line_ending(chunk).to_owned();
            event.start_line = self.start_line;
            event.end_line = self.start_line + n_lines;
            event.pid = event.pid.or(self.pid);
            self.start_line += n_lines;
            self.echo(&event);
            self.deliver(event);
        }

        self.current = next.and_then(|fields| self.claim_uuid(fields));
    }

    /// Keep a marker as pending if it names a uuid, renaming repeats.
    fn claim_uuid(&mut self, mut fields: Map<String, Value>) -> Option<Map<String, Value>> {
        let uuid = fields
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|uuid| !uuid.is_empty())?
            .to_owned();
        let seen = self.seen_uuids.entry(uuid.clone()).or_insert(0);
        *seen += 1;
        if *seen > 1 {
            let rewritten = format!("{uuid}_{seen}");
            tracing::debug!(uuid = %uuid, rewritten = %rewritten, "Duplicate event uuid");
            fields.insert("uuid".to_string(), Value::String(rewritten));
        }
        Some(fields)
    }

    fn echo(&mut self, event: &Event) {
        let as_json = self.json_mode && !event.is_verbose();
        if event.stdout.is_empty() && !event.is_verbose() && !as_json {
            return;
        }
        let line = if as_json {
            serde_json::to_string(event).unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Failed to serialize event for echo");
                event.stdout.clone()
            })
        } else {
            event.stdout.clone()
        };
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = writeln!(log, "{line}") {
                tracing::warn!(error = %e, "Failed to write stdout log");
            }
        }
        if let Some(console) = self.console.as_mut() {
            if let Err(e) = writeln!(console, "{line}") {
                tracing::debug!(error = %e, "Failed to echo output");
            }
        }
    }

    fn deliver(&mut self, event: Event) {
        let counter = event.counter;
        if let Err(e) = self.sink.on_event(event) {
            tracing::error!(counter, error = %e, "Event sink rejected event");
            if self.failure.is_none() {
                self.failure = Some(e);
            }
        }
    }
}

fn strip_line_ending(chunk: &str) -> &str {
    chunk
        .strip_suffix("\r\n")
        .or_else(|| chunk.strip_suffix('\n'))
        .unwrap_or(chunk)
}
