//! Bridge from the decode engine's text message sinks into `tracing`.
//!
//! Engines report diagnostics as a stream of text fragments terminated by an
//! end-of-message flush. [`EngineLogger`] collects the fragments and emits one
//! event per message under the `jpegexp_stream::engine` target.

use std::sync::Mutex;

use tracing::{debug, error, info, warn};

/// Severity of a logger's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A message sink handed to the decode engine.
pub struct EngineLogger {
    level: LogLevel,
    buffer: Mutex<String>,
    last: Mutex<Option<String>>,
}

/// Sink for engine warnings.
pub static WARNINGS: EngineLogger = EngineLogger::new(LogLevel::Warn);
/// Sink for engine errors.
pub static ERRORS: EngineLogger = EngineLogger::new(LogLevel::Error);

impl EngineLogger {
    pub const fn new(level: LogLevel) -> Self {
        Self {
            level,
            buffer: Mutex::new(String::new()),
            last: Mutex::new(None),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Appends a fragment. Line breaks become spaces so each message stays on
    /// one line.
    pub fn put_text(&self, text: &str) {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.extend(text.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
    }

    /// Emits the buffered text when `end_of_message` is set; otherwise a
    /// no-op, so partial messages keep accumulating.
    pub fn flush(&self, end_of_message: bool) {
        if !end_of_message {
            return;
        }
        let message = {
            let mut buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *buffer)
        };
        let message = message.trim();
        if message.is_empty() {
            return;
        }

        match self.level {
            LogLevel::Debug => debug!(target: "jpegexp_stream::engine", "{message}"),
            LogLevel::Info => info!(target: "jpegexp_stream::engine", "{message}"),
            LogLevel::Warn => warn!(target: "jpegexp_stream::engine", "{message}"),
            LogLevel::Error => error!(target: "jpegexp_stream::engine", "{message}"),
        }

        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(message.to_string());
    }

    /// Convenience for engines that report whole messages at once.
    pub fn message(&self, text: &str) {
        self.put_text(text);
        self.flush(true);
    }

    /// The most recently completed message.
    pub fn last_message(&self) -> Option<String> {
        match self.last.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
