//! Vendor protocol adapters.
//!
//! Each adapter knows two things about one chat web application: which
//! client request starts a response worth recording, and how to turn the
//! vendor's streaming response body into a [`DecodedEvent`].
//!
//! Adapters are stateless. The capture path hands them the whole body
//! accumulated so far on every update, so decoding the same bytes always
//! yields the same event.

mod chatgpt;
mod claude;
mod gemini;
mod grok;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::event::DecodedEvent;

pub use chatgpt::ChatGptAdapter;
pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;

// =============================================================================
// Adapter Trait
// =============================================================================

/// Trait for vendor protocol adapters.
pub trait ProtocolAdapter: Send + Sync {
    /// Returns the adapter name used in configuration.
    fn name(&self) -> &'static str;

    /// Checks whether client→server bytes contain the request that starts a
    /// recordable response.
    fn should_record(&self, request: &[u8]) -> bool;

    /// Decodes the accumulated (already decompressed) response body.
    ///
    /// Returns `None` when nothing recognizable has arrived yet.
    fn decode(&self, body: &[u8], done: bool) -> Option<DecodedEvent>;
}

// =============================================================================
// Vendors
// =============================================================================

/// The built-in vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    /// chatgpt.com
    ChatGpt,
    /// claude.ai
    Claude,
    /// aistudio.google.com
    GeminiAiStudio,
    /// grok.com
    Grok,
}

impl Vendor {
    /// Every built-in vendor.
    pub const ALL: [Vendor; 4] = [
        Vendor::ChatGpt,
        Vendor::Claude,
        Vendor::GeminiAiStudio,
        Vendor::Grok,
    ];

    /// Configuration name of the vendor.
    pub fn name(self) -> &'static str {
        match self {
            Vendor::ChatGpt => "chatgpt",
            Vendor::Claude => "claude",
            Vendor::GeminiAiStudio => "gemini-aistudio",
            Vendor::Grok => "grok",
        }
    }

    /// Creates the adapter for this vendor.
    pub fn adapter(self) -> Arc<dyn ProtocolAdapter> {
        match self {
            Vendor::ChatGpt => Arc::new(ChatGptAdapter),
            Vendor::Claude => Arc::new(ClaudeAdapter),
            Vendor::GeminiAiStudio => Arc::new(GeminiAdapter),
            Vendor::Grok => Arc::new(GrokAdapter),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Vendor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Vendor::ALL
            .into_iter()
            .find(|vendor| vendor.name() == s)
            .ok_or_else(|| CoreError::UnknownAdapter(s.to_string()))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Name → adapter lookup.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ProtocolAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// Creates a registry with every built-in vendor adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for vendor in Vendor::ALL {
            registry.register(vendor.adapter());
        }
        registry
    }

    /// Registers an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Looks up an adapter by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Looks up an adapter by name, failing on unknown names.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProtocolAdapter>> {
        self.get(name)
            .ok_or_else(|| CoreError::UnknownAdapter(name.to_string()))
    }

    /// Registered adapter names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

// =============================================================================
// Helpers
// =============================================================================

static SSE_DATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"data:([^\r\n]*)\r?\n\r?\n").expect("Invalid regex pattern"));

/// Yields the payload of every complete `data:` event in an SSE body.
pub(crate) fn sse_data_frames(body: &str) -> impl Iterator<Item = &str> {
    SSE_DATA
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Returns true if `needle` occurs anywhere in `haystack`.
pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    crate::reconstruct::find(haystack, needle).is_some()
}

/// Renders a JSON value as text: strings unquoted, null as empty.
pub(crate) fn json_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decompresses a gzip body, keeping whatever was decoded before an error.
///
/// Streaming responses are decompressed while still incomplete, so a
/// truncated stream is expected. Returns `None` only when nothing at all
/// could be decoded.
pub fn gunzip_lenient(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }

    let mut decoder = MultiGzDecoder::new(data);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match decoder.read(&mut buf) {
            Ok(0) => return Some(out),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => {
                tracing::trace!("gzip stream stopped early: {e}");
                return (!out.is_empty()).then_some(out);
            }
        }
    }
}
