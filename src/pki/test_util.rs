//! In-process certificate authority for tests and local stub servers
//!
//! Mints roots, intermediates, server certificates and signed workload
//! certificates with rcgen. Keys are kept as PEM and reloaded per signature
//! since `KeyPair` isn't `Clone`.

#![allow(missing_docs)]

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

use super::{decode_pem, PkiError, Result, CERTIFICATE_PEM_LABEL};

/// Backdating applied to every certificate so small clock differences between
/// test steps never matter
const BACKDATE: Duration = Duration::minutes(5);

/// A certificate plus its private key
#[derive(Clone)]
pub struct TestCertificate {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub key_pem: String,
    pub key_der: Vec<u8>,
}

/// Knobs for a leaf certificate
#[derive(Clone, Debug)]
pub struct LeafOptions {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub uris: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub server_auth: bool,
    pub client_auth: bool,
    /// Mark the leaf as a CA (must be rejected as an end entity)
    pub is_ca: bool,
}

impl LeafOptions {
    /// A server leaf valid for the given DNS names
    pub fn server(dns_names: &[&str]) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            common_name: dns_names.first().copied().unwrap_or("server").to_string(),
            dns_names: dns_names.iter().map(|s| s.to_string()).collect(),
            uris: Vec::new(),
            not_before: now - BACKDATE,
            not_after: now + Duration::days(1),
            server_auth: true,
            client_auth: false,
            is_ca: false,
        }
    }
}

/// A certificate authority that can sign other certificates
#[derive(Clone)]
pub struct TestAuthority {
    cert_pem: String,
    cert_der: Vec<u8>,
    key_pem: String,
}

impl TestAuthority {
    /// Create a self-signed root CA
    pub fn root(common_name: &str) -> Result<Self> {
        let key = generate_key()?;
        let params = ca_params(common_name);

        let cert = params.self_signed(&key).map_err(|e| {
            PkiError::ParseError(format!("failed to self-sign {}: {}", common_name, e))
        })?;

        Ok(Self {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Create an intermediate CA signed by this authority
    pub fn intermediate(&self, common_name: &str) -> Result<Self> {
        let key = generate_key()?;
        let params = ca_params(common_name);

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            PkiError::ParseError(format!("failed to sign {}: {}", common_name, e))
        })?;

        Ok(Self {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load an authority from PEM certificate and key
    ///
    /// The certificate need not be a CA, which lets tests build chains with
    /// invalid basic constraints.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse key: {}", e)))?;
        let cert_der = decode_pem(cert_pem, CERTIFICATE_PEM_LABEL)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der,
            key_pem: key_pem.to_string(),
        })
    }

    /// PEM-encoded CA certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded CA certificate
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Issue a TLS server certificate for the given DNS names
    pub fn server_cert(&self, dns_names: &[&str]) -> Result<TestCertificate> {
        self.leaf(LeafOptions::server(dns_names))
    }

    /// Issue a leaf certificate with explicit options
    pub fn leaf(&self, options: LeafOptions) -> Result<TestCertificate> {
        let key = generate_key()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = common_name_dn(&options.common_name);
        params.is_ca = if options.is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::NoCa
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = Vec::new();
        if options.server_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ServerAuth);
        }
        if options.client_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ClientAuth);
        }
        params.not_before = options.not_before;
        params.not_after = options.not_after;

        let mut sans = Vec::new();
        for name in &options.dns_names {
            sans.push(SanType::DnsName(ia5(name)?));
        }
        for uri in &options.uris {
            sans.push(SanType::URI(ia5(uri)?));
        }
        params.subject_alt_names = sans;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| PkiError::ParseError(format!("failed to sign leaf: {}", e)))?;

        Ok(TestCertificate {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            key_der: key.serialize_der(),
        })
    }

    /// Sign a workload CSR the way istiod does: client-auth only, identity
    /// SAN taken from the request
    ///
    /// `not_before_offset` shifts the start of validity relative to now; a
    /// positive offset simulates an issuer whose clock runs ahead.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        not_before_offset: Duration,
        lifetime: Duration,
    ) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CSR: {}", e)))?;

        let now = OffsetDateTime::now_utc();
        let not_before = if not_before_offset.is_positive() {
            now + not_before_offset
        } else {
            now - BACKDATE
        };

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_before + lifetime;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|e| PkiError::ParseError(format!("failed to sign CSR: {}", e)))?;

        Ok(cert.pem())
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }
}

/// DER of a PEM certificate, for tests that receive PEM from a stub
pub fn cert_der_from_pem(pem: &str) -> Result<Vec<u8>> {
    decode_pem(pem, CERTIFICATE_PEM_LABEL)
}

fn generate_key() -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e)))
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name_dn(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + Duration::days(365);
    params
}

fn common_name_dn(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("xds-snapshot test".to_string()),
    );
    dn
}

fn ia5(value: &str) -> Result<Ia5String> {
    Ia5String::try_from(value.to_string())
        .map_err(|e| PkiError::ParseError(format!("invalid IA5 string '{}': {}", value, e)))
}
