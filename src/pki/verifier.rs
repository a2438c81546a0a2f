//! rustls adapter for [`ChainValidator`]
//!
//! Used for both outbound handshakes of a run (issuance service and discovery
//! service). The platform trust store is consulted first; when it does not
//! vouch for the peer, the chain must build to the pinned anchor.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use super::{ChainRejection, ChainValidator};

/// Server certificate verifier pinned to a single trust anchor
#[derive(Debug)]
pub struct PinnedAnchorVerifier {
    validator: Arc<ChainValidator>,
    /// Fast path over the platform's native roots, if any were found
    platform: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedAnchorVerifier {
    /// Create a verifier; `platform` is consulted before the pinned anchor
    pub fn new(
        validator: Arc<ChainValidator>,
        platform: Option<Arc<WebPkiServerVerifier>>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            validator,
            platform,
            provider,
        }
    }

    /// The underlying chain validator
    pub fn validator(&self) -> &Arc<ChainValidator> {
        &self.validator
    }
}

impl ServerCertVerifier for PinnedAnchorVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(platform) = &self.platform {
            if platform
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .is_ok()
            {
                debug!(
                    server_name = %server_name.to_str(),
                    "Server certificate trusted by platform store"
                );
                return Ok(ServerCertVerified::assertion());
            }
        }

        let name = server_name.to_str();
        let presented: Vec<&[u8]> = intermediates.iter().map(|c| c.as_ref()).collect();

        match self
            .validator
            .verify(end_entity.as_ref(), &presented, Some(name.as_ref()), now)
        {
            Ok(report) => {
                debug!(
                    server_name = %name,
                    chain_len = report.elements.len(),
                    "Server certificate anchored in pinned root"
                );
                Ok(ServerCertVerified::assertion())
            }
            Err(rejection) => {
                warn!(
                    server_name = %name,
                    statuses = ?rejection.statuses,
                    anchored = rejection.anchored,
                    "Rejecting server certificate"
                );
                Err(rejection_error(rejection))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Wrap a rejection so it survives the trip through rustls
pub fn rejection_error(rejection: ChainRejection) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(rejection))))
}

/// Recover a [`ChainRejection`] from a handshake error, if that is what it was
pub fn rejection_from(err: &rustls::Error) -> Option<&ChainRejection> {
    match err {
        rustls::Error::InvalidCertificate(CertificateError::Other(other)) => {
            other.0.downcast_ref::<ChainRejection>()
        }
        _ => None,
    }
}

/// Build a verifier over the platform's native root store
///
/// Returns `None` when the platform has no usable roots.
pub fn platform_verifier(provider: Arc<CryptoProvider>) -> Option<Arc<WebPkiServerVerifier>> {
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        debug!(errors = native.errors.len(), "Some native roots could not be loaded");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded platform trust store");

    if roots.is_empty() {
        return None;
    }

    match WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider).build() {
        Ok(verifier) => Some(verifier),
        Err(e) => {
            warn!(error = %e, "Platform trust store unusable, relying on pinned anchor only");
            None
        }
    }
}
