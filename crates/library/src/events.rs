use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::Track;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::debug;

use crate::scan::{ProgressTick, ScanResult};

#[derive(Clone, Debug)]
pub enum LibraryEvent {
    Progress(ProgressTick),
    Files(ScanResult),
    Removed(Vec<Track>),
    Error(String),
    QueueAdd(Vec<Track>),
}

impl LibraryEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            LibraryEvent::Progress(_) => "local-files-progress",
            LibraryEvent::Files(_) => "local-files",
            LibraryEvent::Removed(_) => "local-files-removed",
            LibraryEvent::Error(_) => "local-files-error",
            LibraryEvent::QueueAdd(_) => "queue-add",
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            LibraryEvent::Progress(tick) => serde_json::to_value(tick),
            LibraryEvent::Files(tracks) => serde_json::to_value(tracks),
            LibraryEvent::Removed(tracks) | LibraryEvent::QueueAdd(tracks) => {
                serde_json::to_value(tracks)
            }
            LibraryEvent::Error(message) => Ok(json!({ "message": message })),
        }
    }
}

/// One-way outbound channel to the host. Delivery is best effort and
/// `send` must never wait on the consumer.
pub trait Notifier: Send + Sync + 'static {
    fn send(&self, event: LibraryEvent);
}

impl<F> Notifier for F
where
    F: Fn(LibraryEvent) + Send + Sync + 'static,
{
    fn send(&self, event: LibraryEvent) {
        self(event)
    }
}

/// Outbound queue to the host. Progress ticks are capped at `capacity`
/// undelivered entries and dropped past that; every other event is always
/// queued, in order with the ticks that made it in.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<LibraryEvent>,
    pending_progress: Arc<AtomicUsize>,
    capacity: usize,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_progress = Arc::new(AtomicUsize::new(0));
        let notifier = Self {
            tx,
            pending_progress: Arc::clone(&pending_progress),
            capacity: capacity.max(1),
        };
        (
            notifier,
            EventReceiver {
                rx,
                pending_progress,
            },
        )
    }
}

impl Notifier for ChannelNotifier {
    fn send(&self, event: LibraryEvent) {
        if matches!(event, LibraryEvent::Progress(_)) {
            let reserved = self.pending_progress.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |pending| (pending < self.capacity).then_some(pending + 1),
            );
            if reserved.is_err() {
                debug!("Progress queue full; dropping tick");
                return;
            }
        }
        if self.tx.send(event).is_err() {
            debug!("Event receiver closed");
        }
    }
}

pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<LibraryEvent>,
    pending_progress: Arc<AtomicUsize>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<LibraryEvent> {
        let event = self.rx.recv().await?;
        Some(self.delivered(event))
    }

    pub fn try_recv(&mut self) -> Result<LibraryEvent, TryRecvError> {
        self.rx.try_recv().map(|event| self.delivered(event))
    }

    fn delivered(&self, event: LibraryEvent) -> LibraryEvent {
        if matches!(event, LibraryEvent::Progress(_)) {
            self.pending_progress.fetch_sub(1, Ordering::SeqCst);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_payload_uses_host_field_names() {
        let event = LibraryEvent::Progress(ProgressTick {
            scan_progress: 2,
            scan_total: 5,
        });
        assert_eq!(event.channel(), "local-files-progress");
        assert_eq!(
            event.payload().unwrap(),
            json!({ "scanProgress": 2, "scanTotal": 5 })
        );
    }

    fn tick(done: usize) -> LibraryEvent {
        LibraryEvent::Progress(ProgressTick {
            scan_progress: done,
            scan_total: 10,
        })
    }

    #[test]
    fn full_queue_drops_progress_but_keeps_results() {
        let (notifier, mut rx) = ChannelNotifier::new(2);
        for done in 1..=5 {
            notifier.send(tick(done));
        }
        notifier.send(LibraryEvent::Files(ScanResult::new()));
        notifier.send(LibraryEvent::Error("disk gone".to_string()));

        let channels: Vec<&'static str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.channel())
            .collect();
        assert_eq!(
            channels,
            vec![
                "local-files-progress",
                "local-files-progress",
                "local-files",
                "local-files-error",
            ]
        );
    }

    #[test]
    fn draining_frees_progress_slots() {
        let (notifier, mut rx) = ChannelNotifier::new(1);
        notifier.send(tick(1));
        notifier.send(tick(2));
        assert!(matches!(rx.try_recv(), Ok(LibraryEvent::Progress(t)) if t.scan_progress == 1));
        assert!(rx.try_recv().is_err());

        notifier.send(tick(3));
        assert!(matches!(rx.try_recv(), Ok(LibraryEvent::Progress(t)) if t.scan_progress == 3));
    }

    #[test]
    fn closed_queue_is_silent() {
        let (notifier, rx) = ChannelNotifier::new(4);
        drop(rx);
        notifier.send(LibraryEvent::Files(ScanResult::new()));
    }
}
