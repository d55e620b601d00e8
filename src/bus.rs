use crate::answer_log::LogLine;
use crate::ping::PingOutcome;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Events delivered from the scheduler to whoever is driving it.
#[derive(Clone, Debug)]
pub enum SchedulerEvent {
    /// A cycle finished. `logged` is the line written to the answers file,
    /// or `None` when the write failed (a `LogWriteFailed` follows).
    Outcome {
        outcome: PingOutcome,
        logged: Option<LogLine>,
    },
    LogWriteFailed {
        error: String,
    },
}

#[derive(Clone)]
pub struct MessageBus {
    event_tx: mpsc::Sender<SchedulerEvent>,
}

pub struct BusHandle {
    pub event_rx: Arc<Mutex<mpsc::Receiver<SchedulerEvent>>>,
}

impl MessageBus {
    pub fn new() -> (Self, BusHandle) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let bus = MessageBus { event_tx };
        let handle = BusHandle {
            event_rx: Arc::new(Mutex::new(event_rx)),
        };
        (bus, handle)
    }

    pub async fn publish(&self, event: SchedulerEvent) {
        // Nobody listening is fine: the answers file still has the record.
        let _ = self.event_tx.send(event).await;
    }
}

impl BusHandle {
    pub async fn next_event(&self) -> Option<SchedulerEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }
}
