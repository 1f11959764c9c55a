//! Sniff domain policy.
//!
//! Decides per CONNECT whether the tunnel is intercepted or passed through,
//! and holds the upstream proxy URL used to reach the target.
//!
//! Patterns are exact hostnames or `*.`-prefixed suffix wildcards. Matching
//! is case-sensitive and ignores any port on the host.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::dialer::UpstreamDialer;
use crate::error::DialError;

/// Runtime-mutable set of sniff patterns plus the upstream proxy URL.
#[derive(Debug, Default)]
pub struct DomainPolicy {
    domains: RwLock<HashSet<String>>,
    upstream_proxy: RwLock<Option<String>>,
}

impl DomainPolicy {
    /// Creates a policy from patterns and an optional upstream proxy URL.
    pub fn new<I, S>(domains: I, upstream_proxy: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let policy = Self::default();
        for domain in domains {
            policy.add_domain(domain);
        }
        policy.set_upstream_proxy(upstream_proxy);
        policy
    }

    /// Parses a comma separated pattern list (`a.com,*.b.com`).
    pub fn parse_list(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// Adds a pattern. Returns false if it was empty or already present.
    pub fn add_domain(&self, pattern: impl Into<String>) -> bool {
        let pattern = pattern.into();
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return false;
        }
        self.domains.write().insert(pattern.to_string())
    }

    /// Removes a pattern. Returns false if it was not present.
    pub fn remove_domain(&self, pattern: &str) -> bool {
        self.domains.write().remove(pattern.trim())
    }

    /// Current patterns, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<_> = self.domains.read().iter().cloned().collect();
        domains.sort();
        domains
    }

    /// Checks whether a CONNECT host should be intercepted.
    pub fn is_sniff_domain(&self, host: &str) -> bool {
        let host = strip_port(host);
        self.domains
            .read()
            .iter()
            .any(|pattern| pattern_matches(pattern, host))
    }

    /// Replaces the upstream proxy URL (`None` dials directly).
    pub fn set_upstream_proxy(&self, url: Option<String>) {
        let url = url.filter(|u| !u.trim().is_empty());
        *self.upstream_proxy.write() = url;
    }

    /// Current upstream proxy URL.
    pub fn upstream_proxy(&self) -> Option<String> {
        self.upstream_proxy.read().clone()
    }

    /// Builds a dialer for the current upstream proxy URL.
    pub fn dialer(&self) -> Result<UpstreamDialer, DialError> {
        UpstreamDialer::from_url(self.upstream_proxy.read().as_deref())
    }
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => host.ends_with(suffix),
        _ => pattern == host,
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host
            .split_once(']')
            .map(|(h, _)| h.trim_start_matches('['))
            .unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_itself() {
        let policy = DomainPolicy::new(["chatgpt.com"], None);
        assert!(policy.is_sniff_domain("chatgpt.com"));
        assert!(policy.is_sniff_domain("chatgpt.com:443"));
        assert!(!policy.is_sniff_domain("cdn.chatgpt.com"));
        assert!(!policy.is_sniff_domain("notchatgpt.com"));
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let policy = DomainPolicy::new(["*.google.com"], None);
        assert!(policy.is_sniff_domain("aistudio.google.com"));
        assert!(policy.is_sniff_domain("a.b.google.com"));
        assert!(!policy.is_sniff_domain("google.com"));
        assert!(!policy.is_sniff_domain("evilgoogle.com"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let policy = DomainPolicy::new(["claude.ai"], None);
        assert!(!policy.is_sniff_domain("Claude.ai"));
    }

    #[test]
    fn domains_can_change_at_runtime() {
        let policy = DomainPolicy::default();
        assert!(!policy.is_sniff_domain("grok.com"));

        assert!(policy.add_domain(" grok.com "));
        assert!(!policy.add_domain("grok.com"));
        assert!(!policy.add_domain("   "));
        assert!(policy.is_sniff_domain("grok.com"));
        assert_eq!(policy.domains(), vec!["grok.com".to_string()]);

        assert!(policy.remove_domain("grok.com"));
        assert!(!policy.remove_domain("grok.com"));
        assert!(!policy.is_sniff_domain("grok.com"));
    }

    #[test]
    fn parse_list_splits_and_trims() {
        assert_eq!(
            DomainPolicy::parse_list("chatgpt.com, *.openai.com,,"),
            vec!["chatgpt.com".to_string(), "*.openai.com".to_string()]
        );
    }

    #[test]
    fn upstream_proxy_drives_dialer() {
        let policy = DomainPolicy::default();
        assert!(matches!(policy.dialer().unwrap(), UpstreamDialer::Direct));

        policy.set_upstream_proxy(Some("socks5://127.0.0.1:1080".into()));
        assert_eq!(
            policy.upstream_proxy().as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert!(matches!(policy.dialer().unwrap(), UpstreamDialer::Socks5 { .. }));

        policy.set_upstream_proxy(Some("ftp://proxy".into()));
        assert!(matches!(
            policy.dialer(),
            Err(DialError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));

        policy.set_upstream_proxy(Some(String::new()));
        assert!(policy.upstream_proxy().is_none());
    }

    #[test]
    fn strip_port_handles_ipv6() {
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("example.com"), "example.com");
    }
}
