//! Typed progress events and the per-run reporter
//!
//! Every run emits `started`, any number of `progress` events with
//! non-decreasing percentages, and exactly one `completed` event. The
//! [`ProgressReporter`] enforces that ordering so callers cannot break it.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Identifier of a single background run
pub type RunId = u64;

/// The kind of work a run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Clone,
    Pull,
    Analyze,
}

/// Events published to observers over the event sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        run_id: RunId,
        operation: Operation,
        context: String,
    },
    Progress {
        run_id: RunId,
        operation: Operation,
        stage: String,
        percent: u8,
        current: u64,
        total: Option<u64>,
        message: String,
    },
    Completed {
        run_id: RunId,
        operation: Operation,
        success: bool,
        message: String,
        error: Option<String>,
        count_processed: u64,
    },
}

impl SyncEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            SyncEvent::Started { run_id, .. }
            | SyncEvent::Progress { run_id, .. }
            | SyncEvent::Completed { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Completed { .. })
    }
}

/// Destination for sync events (pub/sub transport adapter)
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SyncEvent);
}

/// Event sink backed by a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: SyncEvent) {
        // Ignore send errors (no subscribers is fine)
        let _ = self.tx.send(event);
    }
}

/// Event sink that records everything in memory
#[derive(Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<SyncEvent> {
        lock(&self.events).clone()
    }

    /// Recorded events belonging to one run
    pub fn events_for(&self, run_id: RunId) -> Vec<SyncEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.run_id() == run_id)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: SyncEvent) {
        lock(&self.events).push(event);
    }
}

#[derive(Debug)]
struct ReporterState {
    started: bool,
    finished: bool,
    last_percent: u8,
    last_stage: String,
    last_current: u64,
    last_total: Option<u64>,
}

/// Per-run event emitter that keeps the event contract intact
#[derive(Clone)]
pub struct ProgressReporter {
    run_id: RunId,
    operation: Operation,
    sink: Arc<dyn EventSink>,
    state: Arc<Mutex<ReporterState>>,
}

impl ProgressReporter {
    pub fn new(run_id: RunId, operation: Operation, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id,
            operation,
            sink,
            state: Arc::new(Mutex::new(ReporterState {
                started: false,
                finished: false,
                last_percent: 0,
                last_stage: String::new(),
                last_current: 0,
                last_total: None,
            })),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Emit the `started` event (only the first call has an effect)
    pub fn started(&self, context: impl Into<String>) {
        let mut state = lock(&self.state);
        if state.started || state.finished {
            return;
        }
        state.started = true;
        self.sink.publish(SyncEvent::Started {
            run_id: self.run_id,
            operation: self.operation,
            context: context.into(),
        });
    }

    /// Emit a progress event; the percentage never goes backwards
    ///
    /// Returns the percentage actually published, or `None` once the run has
    /// finished.
    pub fn progress(
        &self,
        stage: impl Into<String>,
        percent: u8,
        current: u64,
        total: Option<u64>,
        message: impl Into<String>,
    ) -> Option<u8> {
        let mut state = lock(&self.state);
        if state.finished {
            return None;
        }
        let percent = percent.min(100).max(state.last_percent);
        let stage = stage.into();
        state.last_percent = percent;
        state.last_stage.clone_from(&stage);
        state.last_current = current;
        state.last_total = total;
        self.sink.publish(SyncEvent::Progress {
            run_id: self.run_id,
            operation: self.operation,
            stage,
            percent,
            current,
            total,
            message: message.into(),
        });
        Some(percent)
    }

    /// Re-publish the last known position with an advisory message
    pub fn advisory(&self, message: impl Into<String>) -> bool {
        let (stage, percent, current, total) = {
            let state = lock(&self.state);
            if state.finished {
                return false;
            }
            (
                state.last_stage.clone(),
                state.last_percent,
                state.last_current,
                state.last_total,
            )
        };
        self.progress(stage, percent, current, total, message).is_some()
    }

    /// Emit the single terminal event; later calls are ignored
    pub fn completed(
        &self,
        success: bool,
        message: impl Into<String>,
        error: Option<String>,
        count_processed: u64,
    ) -> bool {
        let mut state = lock(&self.state);
        if state.finished {
            return false;
        }
        state.finished = true;
        self.sink.publish(SyncEvent::Completed {
            run_id: self.run_id,
            operation: self.operation,
            success,
            message: message.into(),
            error,
            count_processed,
        });
        true
    }

    /// Highest percentage published so far
    pub fn last_percent(&self) -> u8 {
        lock(&self.state).last_percent
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.state).finished
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
