//! Capture loop: recorded response bytes in, queued events out.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use webtap_core::{DecodedEvent, ProtocolAdapter, ResponseDecoder};

use crate::mitm::disconnected;
use crate::sniff::SniffControl;

/// Recorded chunks buffered between the server pump and the capture loop.
pub(crate) const CAPTURE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Emitter {
    produced: usize,
    queued: usize,
    last_done: bool,
}

impl Emitter {
    fn emit(&mut self, control: &SniffControl, event: DecodedEvent) {
        self.produced += 1;
        self.last_done = event.done;
        if control.publish(event) {
            self.queued += 1;
        }
    }
}

/// Decodes one session's recorded bytes until the session ends.
///
/// Chunks are processed in arrival order. Once the disconnect signal fires,
/// chunks still in the channel are drained before the final decode. The
/// last event produced is always `done`. Returns the number of events queued.
pub(crate) async fn run(
    adapter: Arc<dyn ProtocolAdapter>,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut disconnect: watch::Receiver<bool>,
    control: SniffControl,
) -> usize {
    let name = adapter.name();
    let mut decoder = ResponseDecoder::new(adapter);
    let mut emitter = Emitter::default();

    loop {
        tokio::select! {
            biased;
            chunk = chunks.recv() => match chunk {
                Some(bytes) => {
                    for event in decoder.push(&bytes) {
                        emitter.emit(&control, event);
                    }
                }
                None => break,
            },
            _ = disconnected(&mut disconnect) => {
                while let Some(bytes) = chunks.recv().await {
                    for event in decoder.push(&bytes) {
                        emitter.emit(&control, event);
                    }
                }
                break;
            }
        }
    }

    match decoder.finish() {
        Some(event) => emitter.emit(&control, event),
        None if decoder.received() > 0 && !emitter.last_done => {
            emitter.emit(&control, DecodedEvent::finished());
        }
        None => {}
    }

    tracing::debug!(
        adapter = name,
        received = decoder.received(),
        produced = emitter.produced,
        queued = emitter.queued,
        "capture finished"
    );
    emitter.queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use webtap_core::Vendor;

    fn drain(control: &SniffControl) -> Vec<DecodedEvent> {
        std::iter::from_fn(|| control.get_data_timeout(Duration::ZERO)).collect()
    }

    fn chunk(data: &str) -> Vec<u8> {
        format!("{:x}\r\n{}\r\n", data.len(), data).into_bytes()
    }

    #[tokio::test]
    async fn drains_pending_chunks_after_disconnect() {
        let control = SniffControl::new();
        control.start_sniffing();

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (disconnect_tx, disconnect_rx) = watch::channel(false);

        tx.send(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec())
            .await
            .unwrap();
        tx.send(chunk("data: {\"o\":\"add\",\"v\":{\"message\":{\"content\":{\"parts\":[\"Hel\"]}}}}\n\n"))
            .await
            .unwrap();
        tx.send(chunk("data: {\"o\":\"append\",\"v\":\"lo\"}\n\n"))
            .await
            .unwrap();
        disconnect_tx.send(true).unwrap();
        drop(tx);

        let queued = run(Vendor::ChatGpt.adapter(), rx, disconnect_rx, control.clone()).await;

        let events = drain(&control);
        assert_eq!(events.len(), queued);
        let last = events.last().unwrap();
        assert_eq!(last.content, "Hello");
        assert!(last.done);
        assert!(events[..events.len() - 1].iter().all(|e| !e.done));
    }

    #[tokio::test]
    async fn malformed_response_does_not_end_the_session() {
        let control = SniffControl::new();
        control.start_sniffing();

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (_disconnect_tx, disconnect_rx) = watch::channel(false);
        let header = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";

        let mut bad = header.to_vec();
        bad.extend_from_slice(b"not-hex\r\ndata: {\"v\":\"garbage\"}\r\n");
        tx.send(bad).await.unwrap();

        tx.send(header.to_vec()).await.unwrap();
        tx.send(chunk("data: {\"o\":\"add\",\"v\":{\"message\":{\"content\":{\"parts\":[\"Hel\"]}}}}\n\n"))
            .await
            .unwrap();
        tx.send(chunk("data: {\"o\":\"append\",\"v\":\"lo\"}\n\n"))
            .await
            .unwrap();
        tx.send(chunk("data: [DONE]\n\n")).await.unwrap();
        tx.send(b"0\r\n\r\n".to_vec()).await.unwrap();
        drop(tx);

        run(Vendor::ChatGpt.adapter(), rx, disconnect_rx, control.clone()).await;

        let events = drain(&control);
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| !e.content.contains("garbage")));
        assert_eq!(events.last(), Some(&DecodedEvent::content("Hello", true)));
    }

    #[tokio::test]
    async fn nothing_is_queued_while_not_sniffing() {
        let control = SniffControl::new();
        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (_disconnect_tx, disconnect_rx) = watch::channel(false);

        tx.send(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec())
            .await
            .unwrap();
        drop(tx);

        let queued = run(Vendor::Claude.adapter(), rx, disconnect_rx, control.clone()).await;
        assert_eq!(queued, 0);
        assert!(drain(&control).is_empty());
    }

    #[tokio::test]
    async fn unrecognized_body_still_releases_consumer() {
        let control = SniffControl::new();
        control.start_sniffing();

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (_disconnect_tx, disconnect_rx) = watch::channel(false);

        tx.send(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 9\r\n\r\nforbidden".to_vec())
            .await
            .unwrap();
        drop(tx);

        run(Vendor::Grok.adapter(), rx, disconnect_rx, control.clone()).await;

        let events = drain(&control);
        assert_eq!(events, vec![DecodedEvent::finished()]);
    }

    #[tokio::test]
    async fn silent_session_emits_nothing() {
        let control = SniffControl::new();
        control.start_sniffing();

        let (tx, rx) = mpsc::channel::<Vec<u8>>(CAPTURE_CHANNEL_CAPACITY);
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        disconnect_tx.send(true).unwrap();
        drop(tx);

        assert_eq!(run(Vendor::Grok.adapter(), rx, disconnect_rx, control.clone()).await, 0);
        assert!(drain(&control).is_empty());
    }
}
