//! Key pair and certificate signing request generation
//!
//! The workload generates its own key pair; only the CSR leaves the process.

use std::fmt;

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SignatureAlgorithm,
};
use zeroize::Zeroizing;

use super::{encode_pem, PkiError, Result, WorkloadIdentity, CSR_PEM_LABEL};

/// Asymmetric key algorithm for the workload key pair
///
/// Both curves are at least as strong as RSA-2048.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256
    #[default]
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384
    EcdsaP384,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::EcdsaP256 => f.write_str("ecdsa-p256"),
            KeyAlgorithm::EcdsaP384 => f.write_str("ecdsa-p384"),
        }
    }
}

/// DER-encoded PKCS#10 request binding a public key to a workload identity
#[derive(Clone)]
pub struct SigningRequest {
    der: Vec<u8>,
    identity: WorkloadIdentity,
}

impl SigningRequest {
    /// Raw DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PEM text as expected by the issuance service
    pub fn to_pem(&self) -> String {
        encode_pem(CSR_PEM_LABEL, &self.der)
    }

    /// Identity carried in the request's URI SAN
    pub fn identity(&self) -> &WorkloadIdentity {
        &self.identity
    }
}

impl fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningRequest")
            .field("identity", &self.identity.as_str())
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Locally generated private key, PKCS#8 DER, wiped on drop
pub struct KeyMaterial {
    private_key_der: Zeroizing<Vec<u8>>,
    public_key_der: Vec<u8>,
    algorithm: KeyAlgorithm,
}

impl KeyMaterial {
    /// PKCS#8 DER private key
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    /// SubjectPublicKeyInfo DER of the matching public key
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Algorithm the key was generated with
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Take ownership of the key bytes
    pub fn into_private_key_der(self) -> Zeroizing<Vec<u8>> {
        self.private_key_der
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("private_key_der", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh key pair and a CSR for the given identity
///
/// The request carries the identity as its common name and as its only URI
/// SAN, with data/key encipherment key usage and client-auth as the only
/// extended key usage, so it cannot be used to mint a server certificate.
pub fn generate(
    identity: &WorkloadIdentity,
    algorithm: KeyAlgorithm,
) -> Result<(SigningRequest, KeyMaterial)> {
    // Fresh per call, never reused
    let key_pair = KeyPair::generate_for(algorithm.signature_algorithm()).map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", algorithm, e))
    })?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(identity.as_str().to_string()),
    );
    params.distinguished_name = dn;

    let uri = Ia5String::try_from(identity.as_str().to_string()).map_err(|e| {
        PkiError::InvalidIdentity(format!("{} is not an IA5 string: {}", identity, e))
    })?;
    params.subject_alt_names = vec![SanType::URI(uri)];

    params.key_usages = vec![
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let csr = params.serialize_request(&key_pair).map_err(|e| {
        PkiError::CsrGenerationFailed(format!("failed to create CSR: {}", e))
    })?;

    let request = SigningRequest {
        der: csr.der().to_vec(),
        identity: identity.clone(),
    };
    let key = KeyMaterial {
        private_key_der: Zeroizing::new(key_pair.serialize_der()),
        public_key_der: key_pair.subject_public_key_info(),
        algorithm,
    };

    Ok((request, key))
}
