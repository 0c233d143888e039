use std::{fmt, fs, io::BufReader, path::Path, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};

use crate::{config::PeerVerification, protocol::Credentials};

/// Errors raised while building TLS client state.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to parse PEM data: {0}")]
    Pem(#[source] std::io::Error),
    #[error("no certificate found in certPem")]
    NoCertificate,
    #[error("no private key found in keyPem")]
    NoPrivateKey,
    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path:   String,
        #[source]
        source: std::io::Error,
    },
    #[error("no valid CA certificates found in {0}")]
    EmptyCaBundle(String),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Resolved server certificate policy shared by every identity.
#[derive(Clone)]
pub enum TrustPolicy {
    /// Any server certificate is accepted
    AcceptAny,
    /// Server certificates must chain to one of these roots
    Verify(Arc<RootCertStore>),
}

impl TrustPolicy {
    /// Load the policy described by `verification`, reading the CA bundle if any.
    pub fn load(verification: &PeerVerification) -> Result<Self, IdentityError> {
        match verification {
            PeerVerification::Disabled => Ok(TrustPolicy::AcceptAny),
            PeerVerification::CaBundle(path) => Self::from_ca_bundle(path),
        }
    }

    fn from_ca_bundle(path: &Path) -> Result<Self, IdentityError> {
        let ca_pem = fs::read(path).map_err(|source| IdentityError::CaBundle {
            path: path.display().to_string(),
            source,
        })?;

        let ca_certs = certs(&mut BufReader::new(&*ca_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(IdentityError::Pem)?;

        let mut root_store = RootCertStore::empty();
        root_store.add_parsable_certificates(ca_certs);

        if root_store.is_empty() {
            return Err(IdentityError::EmptyCaBundle(path.display().to_string()));
        }

        tracing::info!("Loaded {} trusted root(s) from {:?}", root_store.len(), path);
        Ok(TrustPolicy::Verify(Arc::new(root_store)))
    }

    pub fn verifies_peer(&self) -> bool {
        matches!(self, TrustPolicy::Verify(_))
    }
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::AcceptAny => f.write_str("AcceptAny"),
            TrustPolicy::Verify(roots) => write!(f, "Verify({} roots)", roots.len()),
        }
    }
}

/// TLS client state for exactly one operation.
///
/// Built fresh from each message's credentials and dropped when the
/// operation (one HTTP call, or one socket's lifetime) ends.
#[derive(Clone)]
pub struct IdentityContext {
    tls:         Arc<ClientConfig>,
    fingerprint: Option<String>,
}

impl IdentityContext {
    /// Build a context that authenticates with `credentials`, or presents no
    /// client certificate when `credentials` is `None`.
    pub fn new(credentials: Option<&Credentials>, trust: &TrustPolicy) -> Result<Self, IdentityError> {
        match credentials {
            Some(credentials) => Self::from_pem(credentials.cert_pem.expose(), credentials.key_pem.expose(), trust),
            None => Self::anonymous(trust),
        }
    }

    /// Build a context from PEM-encoded certificate chain and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str, trust: &TrustPolicy) -> Result<Self, IdentityError> {
        let cert_chain = certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(IdentityError::Pem)?;
        let Some(leaf) = cert_chain.first() else {
            return Err(IdentityError::NoCertificate);
        };
        let fingerprint = hex::encode(Sha256::digest(leaf.as_ref()));

        let key: PrivateKeyDer<'static> = private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(IdentityError::Pem)?
            .ok_or(IdentityError::NoPrivateKey)?;

        let tls = Self::builder(trust)?.with_client_auth_cert(cert_chain, key)?;

        Ok(Self {
            tls:         Arc::new(tls),
            fingerprint: Some(fingerprint),
        })
    }

    /// Build a context that presents no client certificate.
    pub fn anonymous(trust: &TrustPolicy) -> Result<Self, IdentityError> {
        Ok(Self {
            tls:         Arc::new(Self::builder(trust)?.with_no_client_auth()),
            fingerprint: None,
        })
    }

    fn builder(
        trust: &TrustPolicy,
    ) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>, IdentityError> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

        Ok(match trust {
            TrustPolicy::AcceptAny => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider })),
            TrustPolicy::Verify(roots) => builder.with_root_certificates(roots.clone()),
        })
    }

    /// Shared rustls configuration for socket connectors.
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls.clone()
    }

    /// SHA-256 of the leaf certificate (hex), safe to log.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityContext")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Server certificate verifier that accepts every chain. Handshake signatures
/// are still checked so the peer must hold the key for what it presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Secret;

    const CLIENT_CERT: &str = include_str!("../../certs/test/client.pem");
    const CLIENT_KEY: &str = include_str!("../../certs/test/client.key.pem");
    const CA_BUNDLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../certs/test/root-ca.pem");

    #[test]
    fn builds_from_pem_pair() {
        let identity = IdentityContext::from_pem(CLIENT_CERT, CLIENT_KEY, &TrustPolicy::AcceptAny).unwrap();
        let fingerprint = identity.fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(identity.tls_config().client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn anonymous_presents_no_certificate() {
        let identity = IdentityContext::new(None, &TrustPolicy::AcceptAny).unwrap();
        assert!(identity.fingerprint().is_none());
        assert!(!identity.tls_config().client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn fresh_context_per_call() {
        let credentials = Credentials {
            cert_pem: Secret::new(CLIENT_CERT),
            key_pem:  Secret::new(CLIENT_KEY),
        };
        let a = IdentityContext::new(Some(&credentials), &TrustPolicy::AcceptAny).unwrap();
        let b = IdentityContext::new(Some(&credentials), &TrustPolicy::AcceptAny).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(!Arc::ptr_eq(&a.tls_config(), &b.tls_config()));
    }

    #[test]
    fn rejects_missing_material() {
        let err = IdentityContext::from_pem("not a pem", CLIENT_KEY, &TrustPolicy::AcceptAny).unwrap_err();
        assert!(matches!(err, IdentityError::NoCertificate), "{err}");

        let err = IdentityContext::from_pem(CLIENT_CERT, CLIENT_CERT, &TrustPolicy::AcceptAny).unwrap_err();
        assert!(matches!(err, IdentityError::NoPrivateKey), "{err}");
    }

    #[test]
    fn debug_never_shows_key_material() {
        let identity = IdentityContext::from_pem(CLIENT_CERT, CLIENT_KEY, &TrustPolicy::AcceptAny).unwrap();
        let debug = format!("{identity:?}");
        assert!(!debug.contains("BEGIN"));
        assert!(debug.contains(identity.fingerprint().unwrap()));
    }

    #[test]
    fn loads_ca_bundle_for_verification() {
        let trust = TrustPolicy::load(&PeerVerification::CaBundle(CA_BUNDLE.into())).unwrap();
        assert!(trust.verifies_peer());
        assert!(IdentityContext::from_pem(CLIENT_CERT, CLIENT_KEY, &trust).is_ok());

        let missing = TrustPolicy::load(&PeerVerification::CaBundle("/nonexistent/ca.pem".into()));
        assert!(matches!(missing, Err(IdentityError::CaBundle { .. })));
        assert!(!TrustPolicy::load(&PeerVerification::Disabled).unwrap().verifies_peer());
    }
}
