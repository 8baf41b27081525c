//! Pluggable consumer for drained command records.
//!
//! Interpreting commands (the GL/decoder engine) is out of scope for the
//! channel layer; the channel validates framing and hands each record to a
//! [`CommandSink`]. Callers provide the real decoder, tests observe traffic
//! with [`RecordingSink`], and [`NullSink`] is the default when nobody cares.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// A sink rejected a record it was asked to consume.
///
/// Surfaces to the producing side as a malformed-command endpoint error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command rejected: {0}")]
pub struct SinkError(pub &'static str);

/// Receives every validated command record an endpoint consumes, in order.
pub trait CommandSink: Send {
    fn consume(&mut self, command: &[u8]) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl CommandSink for NullSink {
    fn consume(&mut self, _command: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Mirrors consumed records into a shared vector.
pub struct RecordingSink {
    shared: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingSink {
    /// The sink goes to the endpoint; the handle stays with the observer.
    pub fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let shared = Arc::new(Mutex::new(Vec::new()));
        (Self { shared: shared.clone() }, shared)
    }
}

impl CommandSink for RecordingSink {
    fn consume(&mut self, command: &[u8]) -> Result<(), SinkError> {
        self.shared.lock().unwrap().push(command.to_vec());
        Ok(())
    }
}
