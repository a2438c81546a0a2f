//! The client credential produced by a bootstrap

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::pki::{encode_pem, PkiError, WorkloadIdentity, CERTIFICATE_PEM_LABEL};

const PRIVATE_KEY_PEM_LABEL: &str = "PRIVATE KEY";

/// Validated certificate chain plus the private key it certifies
///
/// Lives for one run. The credential's own copy of the key is wiped when it
/// is dropped; copies handed out by [`IssuedCredential::private_key`] are not.
pub struct IssuedCredential {
    chain: Vec<Vec<u8>>,
    key: Zeroizing<Vec<u8>>,
    identity: WorkloadIdentity,
    serial: String,
    not_before: SystemTime,
    not_after: SystemTime,
}

impl IssuedCredential {
    /// Assemble a credential from a chain (leaf first) and a PKCS#8 key
    ///
    /// Callers are expected to have validated the chain already.
    pub(crate) fn assemble(
        chain: Vec<Vec<u8>>,
        key: Zeroizing<Vec<u8>>,
        identity: WorkloadIdentity,
    ) -> Result<Self, PkiError> {
        let leaf = chain
            .first()
            .ok_or_else(|| PkiError::ParseError("certificate chain is empty".to_string()))?;
        let (_, cert) = X509Certificate::from_der(leaf)
            .map_err(|e| PkiError::ParseError(format!("failed to parse leaf: {}", e)))?;

        let serial = cert.raw_serial_as_string();
        let not_before = to_system_time(cert.validity().not_before.timestamp());
        let not_after = to_system_time(cert.validity().not_after.timestamp());

        Ok(Self {
            chain,
            key,
            identity,
            serial,
            not_before,
            not_after,
        })
    }

    /// Identity the credential was issued for
    pub fn identity(&self) -> &WorkloadIdentity {
        &self.identity
    }

    /// Leaf certificate DER
    pub fn leaf_der(&self) -> &[u8] {
        // assemble() guarantees a non-empty chain
        &self.chain[0]
    }

    /// Every certificate in the chain, leaf first
    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// Leaf serial number, colon separated hex
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Start of the leaf's validity
    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    /// End of the leaf's validity
    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// Chain in the form rustls wants for client authentication
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect()
    }

    /// Private key in the form rustls wants for client authentication
    ///
    /// Returns a plain copy that lives as long as whatever holds it, typically
    /// the rustls client config of a channel.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.to_vec()))
    }

    /// Export chain and key as one PEM bundle (certificates first)
    pub fn to_pem_bundle(&self) -> Zeroizing<String> {
        let mut bundle = Zeroizing::new(String::new());
        for der in &self.chain {
            bundle.push_str(&encode_pem(CERTIFICATE_PEM_LABEL, der));
        }
        let key_pem = Zeroizing::new(encode_pem(PRIVATE_KEY_PEM_LABEL, &self.key));
        bundle.push_str(&key_pem);
        bundle
    }
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("identity", &self.identity.as_str())
            .field("serial", &self.serial)
            .field("chain_len", &self.chain.len())
            .field("not_after", &self.not_after)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn to_system_time(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
    }
}
