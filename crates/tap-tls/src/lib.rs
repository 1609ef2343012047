use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CA_CERT_ENV: &str = "CA_CERT";
pub const CA_KEY_ENV: &str = "CA_KEY";

const LEAF_VALIDITY: time::Duration = time::Duration::hours(1);

const LEAF_COUNTRY: &str = "US";
const LEAF_PROVINCE: &str = "WA";
const LEAF_LOCALITY: &str = "Kirkland";
const LEAF_ORGANIZATION: &str = "Chainguard";
const LEAF_ORGANIZATIONAL_UNIT: &str = "Academy";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("missing {name} environment variable")]
    MissingEnv { name: &'static str },
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("invalid CA certificate: {0}")]
    InvalidCaCertificate(String),
    #[error("invalid leaf material: {0}")]
    InvalidLeafMaterial(String),
    #[error("leaf store lock poisoned")]
    LockPoisoned,
}

/// The CA key pair as PEM blobs, exactly as the environment supplies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CaConfig {
    /// Reads `CA_CERT` and `CA_KEY` (literal PEM contents, not paths).
    /// Absence of either is an init-time failure.
    pub fn from_env() -> Result<Self, TlsError> {
        let cert_pem = std::env::var(CA_CERT_ENV)
            .map_err(|_| TlsError::MissingEnv { name: CA_CERT_ENV })?;
        let key_pem =
            std::env::var(CA_KEY_ENV).map_err(|_| TlsError::MissingEnv { name: CA_KEY_ENV })?;
        Ok(Self { cert_pem, key_pem })
    }
}

/// Generates a self-signed Ed25519 CA. Local setup and the test suite use
/// this; production deployments bring their own pair via the environment.
pub fn generate_ca(common_name: &str) -> Result<CaConfig, TlsError> {
    let ca_key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    distinguished_name.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    params.distinguished_name = distinguished_name;

    let ca_cert = params.self_signed(&ca_key)?;
    Ok(CaConfig {
        cert_pem: ca_cert.pem(),
        key_pem: ca_key.serialize_pem(),
    })
}

/// A freshly minted per-host certificate and its private key, PEM-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Signs per-host leaf certificates with the configured CA key pair.
///
/// Constructed once at startup and threaded explicitly through the pipeline
/// so tests can mint under a throwaway CA.
pub struct LeafAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
}

impl LeafAuthority {
    pub fn new(config: &CaConfig) -> Result<Self, TlsError> {
        let ca_key = KeyPair::from_pem(&config.key_pem)?;
        let ca_cert_der =
            CertificateDer::from_pem_slice(config.cert_pem.as_bytes()).map_err(|error| {
                TlsError::InvalidCaCertificate(format!("failed to parse CA PEM: {error}"))
            })?;
        let issuer = Issuer::from_ca_cert_pem(&config.cert_pem, ca_key)?;
        Ok(Self {
            issuer,
            ca_cert_der,
        })
    }

    /// Mints a leaf for `hostname`: fresh Ed25519 key, CN and SAN equal to
    /// the hostname, one hour of validity, random positive 63-bit serial,
    /// signed by the CA. Identical inputs still yield distinct outputs.
    pub fn mint(&self, hostname: &str) -> Result<MintedLeaf, TlsError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, hostname);
        distinguished_name.push(DnType::CountryName, LEAF_COUNTRY);
        distinguished_name.push(DnType::StateOrProvinceName, LEAF_PROVINCE);
        distinguished_name.push(DnType::LocalityName, LEAF_LOCALITY);
        distinguished_name.push(DnType::OrganizationName, LEAF_ORGANIZATION);
        distinguished_name.push(DnType::OrganizationalUnitName, LEAF_ORGANIZATIONAL_UNIT);
        params.distinguished_name = distinguished_name;

        params.subject_alt_names.push(SanType::DnsName(hostname.try_into()?));

        let not_before = time::OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + LEAF_VALIDITY;
        params.serial_number = Some(SerialNumber::from(random_serial()));

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
        let leaf_cert = params.signed_by(&leaf_key, &self.issuer)?;

        Ok(MintedLeaf {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }
}

// Matches the serial range of a 63-bit signed-positive integer.
fn random_serial() -> u64 {
    rand::random::<u64>() >> 1
}

/// A leaf retained for the process lifetime: the PEM pair plus the rustls
/// signing material assembled from it.
pub struct CachedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
    certified_key: Arc<CertifiedKey>,
}

impl CachedLeaf {
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

/// Per-SNI leaf map. Read-or-insert runs under one mutex covering the whole
/// check-mint-insert region, so concurrent handshakes for a hostname observe
/// exactly one record.
pub struct LeafStore {
    authority: LeafAuthority,
    leaves: Mutex<HashMap<String, Arc<CachedLeaf>>>,
}

impl LeafStore {
    pub fn new(authority: LeafAuthority) -> Self {
        Self {
            authority,
            leaves: Mutex::new(HashMap::new()),
        }
    }

    pub fn leaf_for_host(&self, hostname: &str) -> Result<Arc<CachedLeaf>, TlsError> {
        let mut leaves = self.leaves.lock().map_err(|_| TlsError::LockPoisoned)?;

        if let Some(leaf) = leaves.get(hostname) {
            debug!(hostname, "reusing leaf certificate");
            return Ok(Arc::clone(leaf));
        }

        info!(hostname, "minting leaf certificate");
        let minted = self.authority.mint(hostname)?;
        let certified_key = certify(&minted, self.authority.ca_certificate_der())?;
        let leaf = Arc::new(CachedLeaf {
            cert_pem: minted.cert_pem,
            key_pem: minted.key_pem,
            certified_key,
        });
        leaves.insert(hostname.to_string(), Arc::clone(&leaf));
        Ok(leaf)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.lock().map(|leaves| leaves.len()).unwrap_or(0)
    }
}

fn certify(
    minted: &MintedLeaf,
    ca_cert_der: &CertificateDer<'static>,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let leaf_der = CertificateDer::from_pem_slice(minted.cert_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidLeafMaterial(format!("failed to parse leaf certificate PEM: {error}"))
    })?;
    let key_der = PrivateKeyDer::from_pem_slice(minted.key_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidLeafMaterial(format!("failed to parse leaf key PEM: {error}"))
    })?;
    let signing_key = any_supported_type(&key_der)?;

    let chain = vec![leaf_der, ca_cert_der.clone()];
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Resolves the serving certificate from the ClientHello SNI, minting on
/// first sight. A hello without SNI cannot name a leaf and fails the
/// handshake, as does a minting error.
pub struct SniLeafResolver {
    store: Arc<LeafStore>,
}

impl SniLeafResolver {
    pub fn new(store: Arc<LeafStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for SniLeafResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniLeafResolver").finish()
    }
}

impl ResolvesServerCert for SniLeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(hostname) = client_hello.server_name() else {
            warn!("client hello carried no SNI; dropping handshake");
            return None;
        };
        match self.store.leaf_for_host(hostname) {
            Ok(leaf) => Some(leaf.certified_key()),
            Err(error) => {
                warn!(hostname, %error, "leaf issuance failed");
                None
            }
        }
    }
}

/// Server-side TLS config for the interception listener.
pub fn interceptor_server_config(store: Arc<LeafStore>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniLeafResolver::new(store)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client-side TLS config for upstream fetches. The ALPN list stays empty so
/// HTTP/2 can never be negotiated.
pub fn upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = Vec::new();
    Arc::new(config)
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
