//! In-memory certificate authority for the MITM proxy.
//!
//! A root CA is generated once per process and signs per-domain leaf
//! certificates on the fly. The root private key only ever lives in memory;
//! the root certificate can be exported so the controlled browser trusts it.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SerialNumber,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

pub use crate::error::CaError;
use crate::tls::{crypto_provider, HTTP1_ALPN};

/// Default common name of the root certificate.
pub const DEFAULT_CA_NAME: &str = "Webtap Root CA";

/// Validity of every certificate issued, root included.
const VALIDITY_DAYS: i64 = 3650;

/// Backdating applied to `not_before` to tolerate clock skew.
const BACKDATE_HOURS: i64 = 1;

/// A signed leaf certificate ready to terminate TLS for one host.
#[derive(Debug)]
pub struct LeafCertificate {
    /// Server config presenting the leaf (chained to the root).
    pub server_config: Arc<ServerConfig>,
    /// Leaf certificate in DER form.
    pub cert_der: CertificateDer<'static>,
}

/// Cache entry for one host, filled by the first caller that signs it.
type LeafSlot = OnceCell<Arc<LeafCertificate>>;

/// Root CA plus the leaf cache.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_pem: String,
    root_der: CertificateDer<'static>,
    leaves: RwLock<HashMap<String, Arc<LeafSlot>>>,
    issued: AtomicU64,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cached())
            .field("issued", &self.issued())
            .finish()
    }
}

impl CertificateAuthority {
    /// Generates a fresh root CA with the default name.
    pub fn new() -> Result<Self, CaError> {
        Self::with_common_name(DEFAULT_CA_NAME)
    }

    /// Generates a fresh root CA with the given common name.
    pub fn with_common_name(common_name: &str) -> Result<Self, CaError> {
        let key = generate_key()?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name.to_string());
        distinguished_name.push(DnType::OrganizationName, "Webtap");
        params.distinguished_name = distinguished_name;
        set_validity(&mut params);

        let cert = params.self_signed(&key)?;
        let root_pem = cert.pem();
        let root_der = cert.der().clone();

        tracing::info!("Generated root CA \"{}\"", common_name);

        Ok(Self {
            issuer: Issuer::new(params, key),
            root_pem,
            root_der,
            leaves: RwLock::new(HashMap::new()),
            issued: AtomicU64::new(0),
            provider: crypto_provider(),
        })
    }

    /// Root certificate in PEM form.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_pem
    }

    /// Root certificate in DER form.
    pub fn root_cert_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Writes the root certificate (never the key) as PEM.
    pub fn export_root_pem(&self, path: impl AsRef<Path>) -> Result<(), CaError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.root_pem.as_bytes())?;
        tracing::info!("Exported root CA certificate to {:?}", path);
        Ok(())
    }

    /// Number of leaves signed so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Number of cached leaves.
    pub fn cached(&self) -> usize {
        self.leaves
            .read()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    /// Returns the leaf for `host`, signing it on first use.
    ///
    /// Concurrent first requests for one host sign exactly once and wait on
    /// that host's slot only; other hosts sign in parallel. A failed signing
    /// leaves the slot empty so the next request retries.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let slot = self.slot(host);
        slot.get_or_try_init(|| self.sign_leaf(host).map(Arc::new))
            .map(Arc::clone)
    }

    /// Async wrapper around [`leaf_for`](Self::leaf_for) that signs on the
    /// blocking pool.
    pub async fn leaf(self: &Arc<Self>, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        if let Some(leaf) = self.leaves.read().get(host).and_then(|slot| slot.get()) {
            return Ok(Arc::clone(leaf));
        }

        let ca = Arc::clone(self);
        let host = host.to_string();
        tokio::task::spawn_blocking(move || ca.leaf_for(&host))
            .await
            .map_err(|e| CaError::Task(e.to_string()))?
    }

    fn slot(&self, host: &str) -> Arc<LeafSlot> {
        if let Some(slot) = self.leaves.read().get(host) {
            return Arc::clone(slot);
        }
        Arc::clone(self.leaves.write().entry(host.to_string()).or_default())
    }

    fn sign_leaf(&self, host: &str) -> Result<LeafCertificate, CaError> {
        let params = leaf_params(host)?;
        let key = generate_key()?;
        let cert = params.signed_by(&key, &self.issuer)?;

        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let chain = vec![cert_der.clone(), self.root_der.clone()];

        let mut server_config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key_der)?;
        server_config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Signed leaf certificate for {}", host);

        Ok(LeafCertificate {
            server_config: Arc::new(server_config),
            cert_der,
        })
    }
}

fn generate_key() -> Result<KeyPair, CaError> {
    Ok(KeyPair::generate_rsa_for(
        &rcgen::PKCS_RSA_SHA256,
        RsaKeySize::_2048,
    )?)
}

fn leaf_params(host: &str) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    set_validity(&mut params);
    Ok(params)
}

fn set_validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(BACKDATE_HOURS);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    // 127-bit positive serial.
    let mut serial = [0u8; 16];
    rand::thread_rng().fill(&mut serial);
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));
}
