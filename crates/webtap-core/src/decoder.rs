//! Per-session decoding pipeline.
//!
//! [`ResponseDecoder`] owns everything one MITM session needs on the capture
//! side: the response reconstructor, the accumulated body and the adapter.
//! Raw server→client bytes go in; [`DecodedEvent`]s come out.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::adapter::{gunzip_lenient, ProtocolAdapter};
use crate::event::DecodedEvent;
use crate::reconstruct::{Frame, ResponseReconstructor};

/// Turns raw response bytes into decoded events for one session.
pub struct ResponseDecoder {
    adapter: Arc<dyn ProtocolAdapter>,
    reconstructor: ResponseReconstructor,
    data_buffer: Vec<u8>,
    received: usize,
}

impl std::fmt::Debug for ResponseDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDecoder")
            .field("adapter", &self.adapter.name())
            .field("buffered", &self.data_buffer.len())
            .field("received", &self.received)
            .finish()
    }
}

impl ResponseDecoder {
    /// Creates a decoder for one session.
    pub fn new(adapter: Arc<dyn ProtocolAdapter>) -> Self {
        Self {
            adapter,
            reconstructor: ResponseReconstructor::new(),
            data_buffer: Vec::new(),
            received: 0,
        }
    }

    /// Feeds raw server→client bytes and returns the events they produced.
    ///
    /// Every complete body segment yields one snapshot of the whole response
    /// decoded so far. When a response ends its final snapshot is emitted with
    /// `done` set and the body buffer starts over for the next response on the
    /// connection.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        self.received += bytes.len();

        for frame in self.reconstructor.push(bytes) {
            match frame {
                Frame::Data(chunk) => {
                    self.data_buffer.extend_from_slice(&chunk);
                    if let Some(event) = self.decode(false) {
                        events.push(event);
                    }
                }
                Frame::End => {
                    trace!(bytes = self.data_buffer.len(), "response complete");
                    events.extend(self.finish());
                    self.data_buffer.clear();
                }
                Frame::Reset => {
                    debug!(adapter = self.adapter.name(), "response framing reset");
                }
            }
        }

        events
    }

    /// Decodes the accumulated body one last time with `done` forced.
    ///
    /// Returns `None` if nothing was recorded or nothing in it was recognized.
    pub fn finish(&self) -> Option<DecodedEvent> {
        let mut event = self.decode(true)?;
        event.done = true;
        Some(event)
    }

    /// Bytes of response body accumulated for the current response.
    pub fn buffered(&self) -> usize {
        self.data_buffer.len()
    }

    /// Raw bytes fed in over the whole session.
    pub fn received(&self) -> usize {
        self.received
    }

    fn decode(&self, done: bool) -> Option<DecodedEvent> {
        if self.data_buffer.is_empty() {
            return None;
        }

        let body: Cow<'_, [u8]> = if self.reconstructor.is_gzip() {
            Cow::Owned(gunzip_lenient(&self.data_buffer)?)
        } else {
            Cow::Borrowed(&self.data_buffer)
        };

        self.adapter.decode(&body, done)
    }
}
