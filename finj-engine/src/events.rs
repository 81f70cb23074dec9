//! Outbound status events.
//!
//! Every component that produces a status event goes through one
//! [`EventSink`]. Emission takes a lock, reads the clock and enqueues, so the
//! queue order is also timestamp order. Each event carries the session epoch
//! that was active when it was produced; the session layer uses it to route
//! the event to the right controller connection or to drop it.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use finj_common::{EventKind, SessionEpoch, StatusEvent, Task, unix_now};

/// An event tagged with the epoch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedEvent {
    pub epoch: Option<SessionEpoch>,
    pub event: StatusEvent,
}

/// Items carried by the sink's queue.
#[derive(Debug)]
pub enum SinkItem {
    Event(StampedEvent),
    /// Resolved by the consumer once everything queued before it is handled.
    Flush(oneshot::Sender<()>),
}

struct SinkState {
    tx: mpsc::UnboundedSender<SinkItem>,
    epoch: Option<SessionEpoch>,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl EventSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            state: Arc::new(Mutex::new(SinkState { tx, epoch: None })),
        };
        (sink, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Epoch stamped onto events emitted from now on.
    pub fn set_epoch(&self, epoch: Option<SessionEpoch>) {
        self.lock().epoch = epoch;
    }

    pub fn epoch(&self) -> Option<SessionEpoch> {
        self.lock().epoch
    }

    /// Emit an event built from the current time.
    pub fn emit_with(&self, build: impl FnOnce(i64) -> StatusEvent) {
        let state = self.lock();
        let event = build(unix_now());
        trace!("Emitting {} (epoch {:?})", event.kind, state.epoch);
        // A closed receiver means the engine is going away.
        let _ = state.tx.send(SinkItem::Event(StampedEvent {
            epoch: state.epoch,
            event,
        }));
    }

    pub fn task_event(&self, kind: EventKind, task: &Task) {
        self.emit_with(|ts| StatusEvent::for_task(kind, ts, task));
    }

    pub fn task_error(&self, task: &Task, code: i32, output: Option<String>) {
        self.emit_with(|ts| {
            StatusEvent::for_task(EventKind::Err, ts, task)
                .with_error(code)
                .with_output(output)
        });
    }

    pub fn task_end(&self, task: &Task, output: Option<String>) {
        self.emit_with(|ts| StatusEvent::for_task(EventKind::End, ts, task).with_output(output));
    }

    pub fn reset(&self) {
        self.emit_with(|ts| StatusEvent::bare(EventKind::Reset, ts));
    }

    /// Wait until the consumer has handled everything emitted so far.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self.lock().tx.send(SinkItem::Flush(done_tx)).is_ok();
        if sent {
            let _ = done_rx.await;
        }
    }
}
