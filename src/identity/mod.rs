//! Workload identity bootstrap
//!
//! Turns a service-account token into a client certificate istiod will accept
//! on the discovery port.
//!
//! # Flow
//!
//! 1. Attach the bearer token and cluster id as call metadata
//! 2. Generate a key pair and CSR for the workload's SPIFFE identity
//! 3. Submit the CSR to `IstioCertificateService/CreateCertificate` over a TLS
//!    channel checked against the pinned anchor
//! 4. Validate the returned chain against the same anchor, then wait out
//!    small clock skew
//! 5. Assemble the chain and the local private key into an [`IssuedCredential`]
//!
//! Any failure ends the run; nothing is retried.

pub mod credential;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::pki_types::UnixTime;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::config::{ClockSkewPolicy, KeyAlgorithm, ServiceEndpoint, SnapshotConfig};
use crate::error::{Error, Result};
use crate::pki::{self, decode_certificate_chain, ChainValidator, KeyMaterial, WorkloadIdentity};
use crate::proto::istio_certificate_service_client::IstioCertificateServiceClient;
use crate::proto::IstioCertificateRequest;
use crate::transport::{until_cancelled, with_deadline, ChannelFactory};

pub use credential::IssuedCredential;

/// Metadata key carrying the cluster identifier on issuance calls
pub const CLUSTER_ID_HEADER: &str = "clusterid";

/// Service-account token presented to the issuance service
///
/// Never logged; `Debug` is redacted and the bytes are wiped on drop.
#[derive(Clone)]
pub struct BearerToken(Zeroizing<String>);

impl BearerToken {
    /// Wrap a token, trimming surrounding whitespace (token files end in a newline)
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let raw = Zeroizing::new(token.into());
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::configuration("service account token is empty"));
        }
        Ok(Self(Zeroizing::new(trimmed.to_string())))
    }

    /// The raw token
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

/// What to do about an issued certificate's start of validity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkewVerdict {
    /// Already valid
    Ready,
    /// Valid after the given wait, which is within tolerance
    Wait(Duration),
    /// Starts further in the future than tolerated
    TooFar(Duration),
}

/// Compare `not_before` against `now` under the skew policy
pub fn assess_skew(not_before: SystemTime, now: SystemTime, policy: &ClockSkewPolicy) -> SkewVerdict {
    match not_before.duration_since(now) {
        Ok(ahead) if ahead.is_zero() => SkewVerdict::Ready,
        Ok(ahead) if ahead > policy.max_skew => SkewVerdict::TooFar(ahead),
        Ok(ahead) => SkewVerdict::Wait(ahead),
        Err(_) => SkewVerdict::Ready,
    }
}

/// Block until `not_before` has passed, if that is within tolerance
pub async fn wait_until_valid(
    not_before: SystemTime,
    policy: &ClockSkewPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut waited = false;
    loop {
        match assess_skew(not_before, SystemTime::now(), policy) {
            SkewVerdict::Ready => {
                if waited {
                    info!("Issued certificate is now valid");
                }
                return Ok(());
            }
            SkewVerdict::TooFar(skew) => {
                warn!(
                    skew_ms = skew.as_millis() as u64,
                    limit_ms = policy.max_skew.as_millis() as u64,
                    "Issued certificate starts too far in the future"
                );
                return Err(Error::ClockSkew {
                    skew,
                    limit: policy.max_skew,
                });
            }
            SkewVerdict::Wait(remaining) => {
                if !waited {
                    info!(
                        skew_ms = remaining.as_millis() as u64,
                        "Issued certificate not yet valid, waiting out clock skew"
                    );
                    waited = true;
                }
                let pause = remaining.min(policy.poll_interval);
                until_cancelled(cancel, async {
                    tokio::time::sleep(pause).await;
                    Ok(())
                })
                .await?;
            }
        }
    }
}

/// Runs the certificate bootstrap exchange
pub struct IdentityBootstrapper {
    channels: ChannelFactory,
    validator: Arc<ChainValidator>,
    cluster_id: String,
    cert_ttl: Duration,
    key_algorithm: KeyAlgorithm,
    clock_skew: ClockSkewPolicy,
    response_timeout: Duration,
}

impl IdentityBootstrapper {
    /// Create a bootstrapper sharing the run's channel factory and validator
    pub fn new(
        channels: ChannelFactory,
        validator: Arc<ChainValidator>,
        config: &SnapshotConfig,
    ) -> Self {
        Self {
            channels,
            validator,
            cluster_id: config.cluster_id.clone(),
            cert_ttl: config.cert_ttl,
            key_algorithm: config.key_algorithm,
            clock_skew: config.clock_skew,
            response_timeout: config.response_timeout,
        }
    }

    /// Obtain a validated client credential for `identity`
    pub async fn bootstrap(
        &self,
        identity: &WorkloadIdentity,
        endpoint: &ServiceEndpoint,
        token: &BearerToken,
        cancel: &CancellationToken,
    ) -> Result<IssuedCredential> {
        let (request, key) = pki::generate(identity, self.key_algorithm)
            .map_err(|e| Error::configuration(e.to_string()))?;
        info!(
            identity = %identity,
            algorithm = %self.key_algorithm,
            "Generated key pair and CSR"
        );

        let mut rpc = tonic::Request::new(IstioCertificateRequest {
            csr: request.to_pem(),
            validity_duration: self.cert_ttl.as_secs() as i64,
            metadata: None,
        });
        self.attach_credentials(&mut rpc, token)?;

        let channel = until_cancelled(cancel, self.channels.connect(endpoint, None)).await?;
        let mut client = IstioCertificateServiceClient::new(channel);

        info!(
            endpoint = %endpoint,
            ttl_secs = self.cert_ttl.as_secs(),
            "Submitting CSR to issuance service"
        );
        let response = until_cancelled(
            cancel,
            with_deadline(self.response_timeout, "certificate issuance", async {
                client.create_certificate(rpc).await.map_err(Error::from)
            }),
        )
        .await?;

        let chain = response.into_inner().cert_chain;
        info!(certificates = chain.len(), "Issuance service returned a chain");

        self.accept_chain(&chain, key, identity, cancel).await
    }

    /// Validate an issued chain (PEM, leaf first) and pair it with `key`
    ///
    /// The clock-skew gate runs before chain validation so a certificate that
    /// starts slightly in the future is validated once it has started.
    pub async fn accept_chain(
        &self,
        chain_pem: &[String],
        key: KeyMaterial,
        identity: &WorkloadIdentity,
        cancel: &CancellationToken,
    ) -> Result<IssuedCredential> {
        if chain_pem.is_empty() {
            return Err(Error::protocol(
                "issuance service returned an empty certificate chain",
            ));
        }

        let chain = decode_certificate_chain(chain_pem)
            .map_err(|e| Error::untrusted(format!("issued chain is malformed: {}", e)))?;
        let leaf = leaf_facts(&chain[0])?;

        if !certifies_key(&leaf.public_key, key.public_key_der()) {
            return Err(Error::untrusted(
                "issued certificate does not certify the generated key",
            ));
        }

        // A leaf that has not started yet is judged at its own start time so
        // an untrusted chain is never reported as clock skew
        let verify_at = SystemTime::now().max(leaf.not_before);
        let verify_at = UnixTime::since_unix_epoch(
            verify_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default(),
        );

        let intermediates: Vec<&[u8]> = chain[1..].iter().map(Vec::as_slice).collect();
        let report = self
            .validator
            .verify(&chain[0], &intermediates, None, verify_at)
            .map_err(|rejection| {
                warn!(
                    statuses = ?rejection.statuses,
                    anchored = rejection.anchored,
                    "Rejecting issued certificate"
                );
                Error::untrusted(format!("issued certificate: {}", rejection))
            })?;
        debug!(chain_len = report.elements.len(), "Issued chain anchored in pinned root");

        wait_until_valid(leaf.not_before, &self.clock_skew, cancel).await?;

        let credential = IssuedCredential::assemble(chain, key.into_private_key_der(), identity.clone())
            .map_err(|e| Error::untrusted(e.to_string()))?;
        info!(
            identity = %identity,
            serial = %credential.serial(),
            "Workload certificate issued and validated"
        );
        Ok(credential)
    }

    fn attach_credentials<T>(&self, rpc: &mut tonic::Request<T>, token: &BearerToken) -> Result<()> {
        let mut authorization = MetadataValue::try_from(format!("Bearer {}", token.expose()))
            .map_err(|_| Error::configuration("service account token is not valid header text"))?;
        authorization.set_sensitive(true);

        let cluster_id = MetadataValue::try_from(self.cluster_id.as_str()).map_err(|_| {
            Error::configuration(format!(
                "cluster id '{}' is not valid header text",
                self.cluster_id
            ))
        })?;

        let metadata = rpc.metadata_mut();
        metadata.insert("authorization", authorization);
        metadata.insert(CLUSTER_ID_HEADER, cluster_id);
        Ok(())
    }
}

struct LeafFacts {
    not_before: SystemTime,
    public_key: Vec<u8>,
}

fn leaf_facts(der: &[u8]) -> Result<LeafFacts> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::untrusted(format!("issued leaf is malformed: {}", e)))?;

    let timestamp = cert.validity().not_before.timestamp().max(0) as u64;
    Ok(LeafFacts {
        not_before: SystemTime::UNIX_EPOCH + Duration::from_secs(timestamp),
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    })
}

/// Compare the leaf's key bits with the SPKI we generated
fn certifies_key(leaf_key: &[u8], spki_der: &[u8]) -> bool {
    match SubjectPublicKeyInfo::from_der(spki_der) {
        Ok((_, spki)) => spki.subject_public_key.data.as_ref() == leaf_key,
        Err(_) => false,
    }
}
