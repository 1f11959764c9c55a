//! YAML configuration.
//!
//! ```yaml
//! debug: false
//! ca-export-path: ./webtap-ca.pem
//! instance:
//!   - name: chatgpt
//!     adapter: chatgpt
//!     sniff-port: 3120
//!     sniff-domain: chatgpt.com
//!     proxy-url: socks5://127.0.0.1:1080
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use webtap_core::AdapterRegistry;
use webtap_proxy::{DialError, DomainPolicy, UpstreamDialer};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// No instance is configured.
    #[error("no instance configured")]
    NoInstances,

    /// An instance has an empty name.
    #[error("instance #{0} has no name")]
    MissingName(usize),

    /// Two instances share a name.
    #[error("duplicate instance name: {0}")]
    DuplicateName(String),

    /// Two instances share a port.
    #[error("instances {first} and {second} both use port {port}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    /// The adapter is not registered.
    #[error("instance {instance}: unknown adapter {adapter}")]
    UnknownAdapter { instance: String, adapter: String },

    /// The upstream proxy URL is unusable.
    #[error("instance {instance}: {source}")]
    ProxyUrl {
        instance: String,
        #[source]
        source: DialError,
    },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,
    /// Where to write the root CA certificate.
    #[serde(default)]
    pub ca_export_path: Option<PathBuf>,
    /// Proxy instances.
    #[serde(default)]
    pub instance: Vec<InstanceConfig>,
}

/// One proxy instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    /// Instance name, used in logs and event dumps.
    pub name: String,
    /// Adapter name. Defaults to the instance name.
    #[serde(default)]
    pub adapter: Option<String>,
    /// Listen port on 127.0.0.1.
    #[serde(deserialize_with = "port")]
    pub sniff_port: u16,
    /// Comma separated sniff domains.
    #[serde(default)]
    pub sniff_domain: String,
    /// Sniff domains in list form, merged with `sniff-domain`.
    #[serde(default)]
    pub sniff_domains: Vec<String>,
    /// Upstream proxy URL.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Skip origin certificate verification.
    #[serde(default)]
    pub insecure_upstream: bool,
}

impl InstanceConfig {
    /// Adapter this instance records with.
    pub fn adapter_name(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.name)
    }

    /// All sniff domains from both forms.
    pub fn domains(&self) -> Vec<String> {
        let mut domains = DomainPolicy::parse_list(&self.sniff_domain);
        domains.extend(
            self.sniff_domains
                .iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
        );
        domains
    }

    /// Builds the domain policy for this instance.
    pub fn policy(&self) -> DomainPolicy {
        DomainPolicy::new(self.domains(), self.proxy_url.clone())
    }
}

/// Accepts both `3120` and `"3120"`.
fn port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl AppConfig {
    /// Reads and validates a config file.
    pub fn load(path: &Path, registry: &AdapterRegistry) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        config.validate(registry)?;
        Ok(config)
    }

    /// Parses YAML without validating.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Checks names, ports, adapters and upstream URLs.
    pub fn validate(&self, registry: &AdapterRegistry) -> Result<(), ConfigError> {
        if self.instance.is_empty() {
            return Err(ConfigError::NoInstances);
        }

        let mut names = HashSet::new();
        let mut ports: Vec<(u16, &str)> = Vec::new();

        for (index, instance) in self.instance.iter().enumerate() {
            let name = instance.name.trim();
            if name.is_empty() {
                return Err(ConfigError::MissingName(index));
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }

            if let Some((_, first)) = ports.iter().find(|(p, _)| *p == instance.sniff_port) {
                return Err(ConfigError::DuplicatePort {
                    port: instance.sniff_port,
                    first: first.to_string(),
                    second: name.to_string(),
                });
            }
            ports.push((instance.sniff_port, name));

            if registry.get(instance.adapter_name()).is_none() {
                return Err(ConfigError::UnknownAdapter {
                    instance: name.to_string(),
                    adapter: instance.adapter_name().to_string(),
                });
            }

            UpstreamDialer::from_url(instance.proxy_url.as_deref()).map_err(|source| {
                ConfigError::ProxyUrl {
                    instance: name.to_string(),
                    source,
                }
            })?;
        }

        Ok(())
    }
}
