//! Certificate chain validation against a single pinned trust anchor
//!
//! The pinned anchor is never part of the platform trust store, so a chain
//! that builds all the way to it always ends in an "untrusted root" status.
//! That status, and only that status, is tolerated, and only when the anchor
//! is provably one of the built chain's elements. Revocation is never checked
//! since the mesh CA publishes neither CRLs nor OCSP.

use std::fmt;

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use thiserror::Error;
use x509_parser::prelude::*;

use super::{decode_pem, Fingerprint, PkiError, Result, CERTIFICATE_PEM_LABEL};

/// Longest chain we are willing to build, anchor included
const MAX_CHAIN_DEPTH: usize = 8;

/// The sole root of trust for both TLS validations of a run
#[derive(Clone)]
pub struct TrustAnchor {
    der: Vec<u8>,
    fingerprint: Fingerprint,
    subject: String,
}

impl TrustAnchor {
    /// Load the anchor from DER bytes
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let subject = {
            let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
                PkiError::ParseError(format!("failed to parse trust anchor: {}", e))
            })?;
            cert.subject().to_string()
        };
        let fingerprint = Fingerprint::of(&der);
        Ok(Self {
            der,
            fingerprint,
            subject,
        })
    }

    /// Load the anchor from a PEM certificate
    pub fn from_pem(pem: &str) -> Result<Self> {
        Self::from_der(decode_pem(pem, CERTIFICATE_PEM_LABEL)?)
    }

    /// DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Subject distinguished name, for diagnostics
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// A defect found while building or checking a chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainStatus {
    /// The chain ends at a self-signed root outside the platform store
    UntrustedRoot,
    /// No issuer could be found for some element
    PartialChain,
    /// An element is expired or not yet valid
    NotTimeValid,
    /// A signature in the chain does not verify
    NotSignatureValid,
    /// An issuing element is not a CA, or the leaf is one
    InvalidBasicConstraints,
    /// The leaf is not valid for the expected server name
    NameMismatch,
    /// The pinned anchor itself was presented as the leaf
    AnchorAsLeaf,
    /// A presented certificate could not be parsed
    Malformed,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainStatus::UntrustedRoot => "untrusted root",
            ChainStatus::PartialChain => "partial chain",
            ChainStatus::NotTimeValid => "not time valid",
            ChainStatus::NotSignatureValid => "signature invalid",
            ChainStatus::InvalidBasicConstraints => "invalid basic constraints",
            ChainStatus::NameMismatch => "name mismatch",
            ChainStatus::AnchorAsLeaf => "trust anchor presented as leaf",
            ChainStatus::Malformed => "malformed certificate",
        };
        f.write_str(s)
    }
}

/// Outcome of building a chain for a presented leaf
#[derive(Clone, Debug, Default)]
pub struct ChainReport {
    /// Fingerprints of the built chain, leaf first
    pub elements: Vec<Fingerprint>,
    /// Every distinct defect, in discovery order
    pub statuses: Vec<ChainStatus>,
}

impl ChainReport {
    /// Whether the given certificate is one of the chain's elements
    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.elements.contains(&fingerprint)
    }

    fn flag(&mut self, status: ChainStatus) {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
    }
}

/// Trust decision for a chain
///
/// Accepts when platform validation already succeeded, or when the only
/// defect is the untrusted (pinned) root and the anchor is in the chain.
pub fn is_trusted(platform_ok: bool, report: &ChainReport, anchor: Fingerprint) -> bool {
    platform_ok
        || (report.statuses == [ChainStatus::UntrustedRoot] && report.contains(anchor))
}

/// Why a chain was rejected
#[derive(Clone, Debug, Error)]
#[error("{}", describe(.statuses, .anchored))]
pub struct ChainRejection {
    /// Defects found while building the chain
    pub statuses: Vec<ChainStatus>,
    /// Whether the pinned anchor appeared in the built chain
    pub anchored: bool,
}

fn describe(statuses: &[ChainStatus], anchored: &bool) -> String {
    let defects: Vec<String> = statuses
        .iter()
        .filter(|s| **s != ChainStatus::UntrustedRoot)
        .map(|s| s.to_string())
        .collect();

    match (defects.is_empty(), *anchored) {
        (true, false) => "chain does not terminate at the pinned trust anchor".to_string(),
        (true, true) => "chain is not anchored in the pinned trust anchor".to_string(),
        (false, _) => format!("chain has defects: {}", defects.join(", ")),
    }
}

/// Stateless validator bound to one trust anchor
///
/// Holds no per-call state; a single instance is shared by the issuance and
/// discovery handshakes and by validation of the issued chain.
#[derive(Clone, Debug)]
pub struct ChainValidator {
    anchor: TrustAnchor,
}

impl ChainValidator {
    /// Create a validator for the given anchor
    pub fn new(anchor: TrustAnchor) -> Self {
        Self { anchor }
    }

    /// The pinned anchor
    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    /// Build a chain for `leaf` and verify it is anchored in the pinned root
    ///
    /// `server_name`, when given, must match one of the leaf's DNS or IP SANs.
    pub fn verify(
        &self,
        leaf: &[u8],
        intermediates: &[&[u8]],
        server_name: Option<&str>,
        now: UnixTime,
    ) -> std::result::Result<ChainReport, ChainRejection> {
        let report = self.build(leaf, intermediates, server_name, now);
        let anchored = report.contains(self.anchor.fingerprint);

        if is_trusted(false, &report, self.anchor.fingerprint) {
            Ok(report)
        } else {
            Err(ChainRejection {
                statuses: report.statuses,
                anchored,
            })
        }
    }

    /// Build a chain and collect every defect without deciding trust
    pub fn build(
        &self,
        leaf_der: &[u8],
        intermediates: &[&[u8]],
        server_name: Option<&str>,
        now: UnixTime,
    ) -> ChainReport {
        let mut report = ChainReport::default();

        let leaf = match X509Certificate::from_der(leaf_der) {
            Ok((_, cert)) => cert,
            Err(_) => {
                report.flag(ChainStatus::Malformed);
                return report;
            }
        };

        let leaf_fp = Fingerprint::of(leaf_der);
        if leaf_fp == self.anchor.fingerprint {
            report.elements.push(leaf_fp);
            report.flag(ChainStatus::AnchorAsLeaf);
            return report;
        }

        // Candidate issuers: the anchor first, then whatever the peer sent
        let mut pool: Vec<(Fingerprint, X509Certificate<'_>)> = Vec::new();
        match X509Certificate::from_der(&self.anchor.der) {
            Ok((_, anchor)) => pool.push((self.anchor.fingerprint, anchor)),
            Err(_) => report.flag(ChainStatus::Malformed),
        }
        for der in intermediates {
            match X509Certificate::from_der(der) {
                Ok((_, cert)) => pool.push((Fingerprint::of(der), cert)),
                Err(_) => report.flag(ChainStatus::Malformed),
            }
        }

        report.elements.push(leaf_fp);
        let mut chain: Vec<&X509Certificate<'_>> = vec![&leaf];

        loop {
            let Some(current) = chain.last().copied() else {
                break;
            };

            if is_self_issued(current) {
                if current.verify_signature(None).is_ok() {
                    report.flag(ChainStatus::UntrustedRoot);
                } else {
                    report.flag(ChainStatus::NotSignatureValid);
                }
                break;
            }

            if chain.len() >= MAX_CHAIN_DEPTH {
                report.flag(ChainStatus::PartialChain);
                break;
            }

            let mut name_matched = false;
            let mut next = None;
            for (fp, candidate) in &pool {
                if report.elements.contains(fp)
                    || candidate.subject().as_raw() != current.issuer().as_raw()
                {
                    continue;
                }
                name_matched = true;
                if current
                    .verify_signature(Some(candidate.public_key()))
                    .is_ok()
                {
                    next = Some((*fp, candidate));
                    break;
                }
            }

            match next {
                Some((fp, issuer)) => {
                    report.elements.push(fp);
                    chain.push(issuer);
                }
                None if name_matched => {
                    report.flag(ChainStatus::NotSignatureValid);
                    break;
                }
                None => {
                    report.flag(ChainStatus::PartialChain);
                    break;
                }
            }
        }

        let now = now.as_secs() as i64;
        for cert in &chain {
            let validity = cert.validity();
            if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
                report.flag(ChainStatus::NotTimeValid);
            }
        }

        if is_ca(&leaf) {
            report.flag(ChainStatus::InvalidBasicConstraints);
        }
        for issuer in chain.iter().skip(1) {
            if !is_ca(issuer) {
                report.flag(ChainStatus::InvalidBasicConstraints);
            }
        }

        if let Some(name) = server_name {
            if !matches_server_name(leaf_der, name) {
                report.flag(ChainStatus::NameMismatch);
            }
        }

        report
    }
}

fn is_self_issued(cert: &X509Certificate<'_>) -> bool {
    cert.subject().as_raw() == cert.issuer().as_raw()
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca)
}

/// Match a server name against the leaf's DNS and IP SANs
fn matches_server_name(leaf_der: &[u8], name: &str) -> bool {
    let Ok(server_name) = ServerName::try_from(name) else {
        return false;
    };
    let der = CertificateDer::from(leaf_der);
    webpki::EndEntityCert::try_from(&der)
        .and_then(|cert| cert.verify_is_valid_for_subject_name(&server_name))
        .is_ok()
}
