//! Webtap Core - response reconstruction, vendor adapters and the event queue.
//!
//! This crate holds everything on the capture side of the proxy that does not
//! touch a socket:
//!
//! - [`reconstruct`] rebuilds HTTP/1.1 response bodies from tapped bytes
//! - [`adapter`] decodes vendor streams (ChatGPT, Claude, AI Studio, Grok)
//! - [`decoder`] ties both together for one session
//! - [`queue`] hands decoded events to the consumer
//!
//! ```text
//! raw bytes → ResponseReconstructor → body → ProtocolAdapter → DecodedEvent → ResponseQueue
//! ```

pub mod adapter;
pub mod decoder;
mod error;
pub mod event;
pub mod queue;
pub mod reconstruct;

pub use adapter::{AdapterRegistry, ProtocolAdapter, Vendor};
pub use decoder::ResponseDecoder;
pub use error::{CoreError, Result};
pub use event::DecodedEvent;
pub use queue::ResponseQueue;
pub use reconstruct::{Frame, ResponseReconstructor};
