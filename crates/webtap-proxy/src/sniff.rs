//! Consumer-facing sniffing switch and event queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use webtap_core::{DecodedEvent, ResponseQueue};

/// Shared sniffing state for one proxy instance.
///
/// Clones share the same flag and queue. Capture loops only publish while
/// sniffing is on; toggling it either way drops pending events.
#[derive(Clone, Default)]
pub struct SniffControl {
    sniffing: Arc<AtomicBool>,
    queue: Arc<ResponseQueue<DecodedEvent>>,
}

impl std::fmt::Debug for SniffControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffControl")
            .field("sniffing", &self.is_sniffing())
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl SniffControl {
    /// Creates a control with sniffing off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts queuing decoded events, dropping anything left over.
    pub fn start_sniffing(&self) {
        self.queue.clear();
        self.sniffing.store(true, Ordering::SeqCst);
        tracing::debug!("sniffing started");
    }

    /// Stops queuing decoded events and clears the queue.
    pub fn stop_sniffing(&self) {
        self.sniffing.store(false, Ordering::SeqCst);
        self.queue.clear();
        tracing::debug!("sniffing stopped");
    }

    /// Returns true while events are being queued.
    pub fn is_sniffing(&self) -> bool {
        self.sniffing.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until an event is available.
    pub fn get_data(&self) -> DecodedEvent {
        self.queue.dequeue_blocking()
    }

    /// Blocks up to `timeout` for an event.
    pub fn get_data_timeout(&self, timeout: Duration) -> Option<DecodedEvent> {
        self.queue.dequeue_timeout(timeout)
    }

    /// Waits asynchronously for an event.
    pub async fn get_data_async(&self) -> DecodedEvent {
        self.queue.dequeue().await
    }

    /// Number of events waiting.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queues an event if sniffing is on. Returns whether it was queued.
    pub(crate) fn publish(&self, event: DecodedEvent) -> bool {
        if !self.is_sniffing() {
            return false;
        }
        self.queue.enqueue(event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_dropped_while_off() {
        let control = SniffControl::new();
        assert!(!control.publish(DecodedEvent::content("x", false)));
        assert_eq!(control.pending(), 0);
    }

    #[test]
    fn toggling_clears_pending_events() {
        let control = SniffControl::new();
        control.start_sniffing();
        assert!(control.publish(DecodedEvent::content("a", false)));
        assert_eq!(control.pending(), 1);

        control.stop_sniffing();
        assert!(!control.is_sniffing());
        assert_eq!(control.pending(), 0);

        control.start_sniffing();
        assert!(control.publish(DecodedEvent::content("b", true)));
        let event = control.get_data_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(event.content, "b");
        assert!(event.done);
    }

    #[test]
    fn clones_share_state() {
        let control = SniffControl::new();
        let consumer = control.clone();
        control.start_sniffing();
        assert!(consumer.is_sniffing());

        let producer = control.clone();
        let handle = std::thread::spawn(move || consumer.get_data());
        producer.publish(DecodedEvent::finished());
        assert!(handle.join().unwrap().done);
    }

    #[tokio::test]
    async fn async_consumer_is_woken() {
        let control = SniffControl::new();
        control.start_sniffing();

        let producer = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.publish(DecodedEvent::content("late", true));
        });

        let event = control.get_data_async().await;
        assert_eq!(event.content, "late");
    }
}
