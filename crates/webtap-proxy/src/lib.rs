//! Webtap Proxy - MITM forward proxy that taps vendor chat streams.
//!
//! A browser pointed at the proxy keeps working normally. `CONNECT` tunnels
//! to hosts in the [`DomainPolicy`] are terminated with a leaf certificate
//! issued by the in-memory [`CertificateAuthority`] and re-encrypted towards
//! the real origin; every other tunnel is relayed blind. Inside an
//! intercepted tunnel, the instance's adapter decides from the request bytes
//! whether to record, and recorded responses are decoded into
//! [`DecodedEvent`](webtap_core::DecodedEvent)s queued on the
//! [`SniffControl`].
//!
//! ## Architecture
//!
//! ```text
//! Client → ProxyServer → handler ─┬─ CONNECT, policy match ─→ mitm ──→ capture → SniffControl
//!                                 ├─ CONNECT, no match ─────→ tunnel
//!                                 └─ plain HTTP ────────────→ forwarded as is
//!                                          │
//!                                          ▼
//!                                   UpstreamDialer (direct / HTTP CONNECT / SOCKS5)
//! ```

mod ca;
mod capture;
mod dialer;
mod domains;
mod error;
mod handler;
pub mod mitm;
mod proxy;
mod sniff;
pub mod tls;
pub mod tunnel;

pub use ca::{CertificateAuthority, LeafCertificate, DEFAULT_CA_NAME};
pub use dialer::{UpstreamDialer, UpstreamStream};
pub use domains::DomainPolicy;
pub use error::{CaError, DialError, ProxyError, Result};
pub use mitm::SessionStats;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use sniff::SniffControl;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;
