//! Progress event bus for replay executions.
//!
//! The replayer emits structured [`ProgressEvent`]s while an execution
//! runs; the bus fans them out to pluggable sinks (tracing output, an
//! in-memory buffer for tests, a channel the API can drain). Event
//! delivery is best-effort: a full or closed channel never fails a replay.

use std::io::Result as IoResult;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ExecutionStatus;

/// A structured progress event emitted during an execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExecutionStarted {
        execution_id: Uuid,
        flow_id: Uuid,
        total: u64,
        when: DateTime<Utc>,
    },
    PairReplayed {
        execution_id: Uuid,
        test_case_id: Uuid,
        ordinal: u32,
        mutant_status: Option<u16>,
        anomalies: usize,
        when: DateTime<Utc>,
    },
    RetryScheduled {
        execution_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        when: DateTime<Utc>,
    },
    ExecutionFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        done: u64,
        failed: u64,
        when: DateTime<Utc>,
    },
    Diagnostic {
        scope: String,
        message: String,
        when: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        ProgressEvent::Diagnostic {
            scope: scope.into(),
            message: message.into(),
            when: Utc::now(),
        }
    }

    /// Short label used by log-oriented sinks.
    #[must_use]
    pub fn scope_label(&self) -> &str {
        match self {
            ProgressEvent::ExecutionStarted { .. } => "execution_started",
            ProgressEvent::PairReplayed { .. } => "pair_replayed",
            ProgressEvent::RetryScheduled { .. } => "retry_scheduled",
            ProgressEvent::ExecutionFinished { .. } => "execution_finished",
            ProgressEvent::Diagnostic { scope, .. } => scope,
        }
    }
}

/// Output target consuming full event objects. Sinks decide how to
/// serialize or format; blocking I/O is acceptable because delivery runs
/// on a dedicated listener task.
pub trait EventSink: Send + Sync {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()>;
}

/// Sink that forwards events to `tracing` at info level.
#[derive(Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()> {
        tracing::info!(scope = event.scope_label(), event = ?event, "replay progress");
        Ok(())
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of everything captured so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(event.clone());
        }
        Ok(())
    }
}

/// Sink that forwards events into a flume channel, e.g. for streaming to
/// API clients. Send failures (receiver dropped) are swallowed.
pub struct ChannelSink {
    tx: flume::Sender<ProgressEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Cheap cloneable handle used by workers to publish events.
#[derive(Clone)]
pub struct EventEmitter {
    tx: flume::Sender<ProgressEvent>,
}

impl EventEmitter {
    /// Publish an event; never blocks and never errors toward the caller.
    pub fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event bus receiver dropped; progress event discarded");
        }
    }
}

/// Fan-out hub: one unbounded channel drained by a listener task that
/// hands every event to each registered sink in order.
pub struct EventBus {
    tx: flume::Sender<ProgressEvent>,
    rx: flume::Receiver<ProgressEvent>,
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    started: std::sync::atomic::AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }
}

impl EventBus {
    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            sinks: Arc::new(Mutex::new(sinks)),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(Box::new(sink));
        }
    }

    #[must_use]
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
        }
    }

    /// Start the listener task. Idempotent; the task exits when every
    /// emitter handle (including the bus itself) is dropped.
    pub fn listen(&self) {
        use std::sync::atomic::Ordering;
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self.rx.clone();
        let sinks = Arc::clone(&self.sinks);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                if let Ok(mut sinks) = sinks.lock() {
                    for sink in sinks.iter_mut() {
                        if let Err(err) = sink.handle(&event) {
                            tracing::warn!(error = %err, "event sink failed");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_memory_sink() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sinks(vec![Box::new(sink.clone())]);
        bus.listen();
        let emitter = bus.emitter();
        emitter.emit(ProgressEvent::diagnostic("test", "one"));
        emitter.emit(ProgressEvent::diagnostic("test", "two"));
        // Listener runs on a spawned task; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let seen = sink.snapshot();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].scope_label(), "test");
    }
}
