//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Upstream dial error.
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] webtap_core::CoreError),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Key generation or signing failed.
    #[error("Failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    /// The leaf could not be turned into a TLS server config.
    #[error("Failed to build TLS config: {0}")]
    Tls(#[from] rustls::Error),

    /// Failed to write the root certificate.
    #[error("Failed to write CA: {0}")]
    Write(#[from] std::io::Error),

    /// Leaf generation task did not complete.
    #[error("Certificate task failed: {0}")]
    Task(String),
}

/// Upstream dialer error type.
#[derive(Debug, Error)]
pub enum DialError {
    /// The upstream proxy URL could not be parsed.
    #[error("Invalid proxy URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The upstream proxy URL uses a scheme the dialer cannot speak.
    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    /// The upstream proxy URL has no host.
    #[error("Proxy URL has no host: {0}")]
    MissingHost(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
