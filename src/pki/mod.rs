//! PKI operations for workload identity bootstrap
//!
//! This module holds everything certificate-shaped: the SPIFFE identity a
//! workload asks for, the key pair and CSR it generates locally, and the
//! validator that decides whether a presented chain is anchored in the single
//! pinned trust anchor.
//!
//! # Security Model
//!
//! - The private key is generated in-process and never written to disk
//! - Only the CSR (public key + identity) is sent to the issuance service
//! - Every chain, whether presented in a TLS handshake or returned by the
//!   issuance service, must build up to the pinned anchor
//! - The anchor itself is never accepted as a leaf

pub mod csr;
pub mod spiffe;
pub mod verifier;
pub mod verify;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

use std::fmt;

use pem::{EncodeConfig, LineEnding, Pem};
use thiserror::Error;

pub use csr::{generate, KeyAlgorithm, KeyMaterial, SigningRequest};
pub use spiffe::WorkloadIdentity;
pub use verifier::PinnedAnchorVerifier;
pub use verify::{ChainRejection, ChainReport, ChainStatus, ChainValidator, TrustAnchor};

/// PEM label for certificate signing requests
pub const CSR_PEM_LABEL: &str = "CERTIFICATE REQUEST";

/// PEM label for certificates
pub const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// CSR construction failed
    #[error("CSR generation failed: {0}")]
    CsrGenerationFailed(String),

    /// Workload identity is not a valid SPIFFE URI
    #[error("invalid workload identity: {0}")]
    InvalidIdentity(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Encode DER bytes as PEM with 64-character lines and LF line endings
pub fn encode_pem(label: &str, der: &[u8]) -> String {
    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    pem::encode_config(&Pem::new(label, der.to_vec()), config)
}

/// Decode a single PEM block, requiring the given label
pub fn decode_pem(pem_data: &str, label: &str) -> Result<Vec<u8>> {
    let pem_obj = pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;

    if pem_obj.tag() != label {
        return Err(PkiError::ParseError(format!(
            "expected PEM block '{}', found '{}'",
            label,
            pem_obj.tag()
        )));
    }

    Ok(pem_obj.into_contents())
}

/// Decode every certificate in a list of PEM strings, preserving order
///
/// Each entry may itself hold several concatenated blocks; non-certificate
/// blocks are rejected.
pub fn decode_certificate_chain<S: AsRef<str>>(pems: &[S]) -> Result<Vec<Vec<u8>>> {
    let mut chain = Vec::new();
    for entry in pems {
        let blocks = pem::parse_many(entry.as_ref().as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse PEM chain: {}", e)))?;
        for block in blocks {
            if block.tag() != CERTIFICATE_PEM_LABEL {
                return Err(PkiError::ParseError(format!(
                    "unexpected PEM block '{}' in certificate chain",
                    block.tag()
                )));
            }
            chain.push(block.into_contents());
        }
    }

    if chain.is_empty() {
        return Err(PkiError::ParseError("certificate chain is empty".to_string()));
    }

    Ok(chain)
}

/// SHA-256 digest of a DER certificate
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint the given DER bytes
    pub fn of(der: &[u8]) -> Self {
        use aws_lc_rs::digest::{digest, SHA256};

        let hash = digest(&SHA256, der);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(hash.as_ref());
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trip_is_exact() {
        let der: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let encoded = encode_pem(CSR_PEM_LABEL, &der);
        let decoded = decode_pem(&encoded, CSR_PEM_LABEL).unwrap();

        assert_eq!(decoded, der);
    }

    #[test]
    fn pem_lines_wrap_at_64_characters() {
        let der = vec![0xAB; 300];
        let encoded = encode_pem(CSR_PEM_LABEL, &der);

        let lines: Vec<&str> = encoded.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE REQUEST-----"));

        let body = &lines[1..lines.len() - 1];
        assert!(body[..body.len() - 1].iter().all(|l| l.len() == 64));
        assert!(body.last().unwrap().len() <= 64);
        assert!(!encoded.contains('\r'));
    }

    #[test]
    fn decode_rejects_wrong_label() {
        let encoded = encode_pem(CERTIFICATE_PEM_LABEL, b"not really a cert");

        let result = decode_pem(&encoded, CSR_PEM_LABEL);

        assert!(matches!(result, Err(PkiError::ParseError(msg)) if msg.contains("expected PEM block")));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_pem("this is not valid PEM data at all", CSR_PEM_LABEL).is_err());
    }

    #[test]
    fn certificate_chain_preserves_order_across_entries() {
        let first = encode_pem(CERTIFICATE_PEM_LABEL, b"leaf");
        let second = encode_pem(CERTIFICATE_PEM_LABEL, b"intermediate");
        let third = encode_pem(CERTIFICATE_PEM_LABEL, b"root");
        let entries = vec![first, format!("{}{}", second, third)];

        let chain = decode_certificate_chain(&entries).unwrap();

        assert_eq!(
            chain,
            vec![b"leaf".to_vec(), b"intermediate".to_vec(), b"root".to_vec()]
        );
    }

    #[test]
    fn certificate_chain_rejects_keys_and_empty_lists() {
        let key = encode_pem("PRIVATE KEY", b"secret");
        assert!(decode_certificate_chain(&[key]).is_err());

        let empty: [&str; 0] = [];
        assert!(decode_certificate_chain(&empty).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes_inputs() {
        let a = Fingerprint::of(b"certificate a");
        let b = Fingerprint::of(b"certificate b");

        assert_eq!(a, Fingerprint::of(b"certificate a"));
        assert_ne!(a, b);
        // 32 bytes rendered as colon separated hex pairs
        assert_eq!(a.to_string().len(), 32 * 3 - 1);
    }
}
