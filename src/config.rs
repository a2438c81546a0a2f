//! Runtime configuration for a snapshot run
//!
//! Everything tunable lives in [`SnapshotConfig`]. The CLI produces one, tests
//! build one directly; either way [`SnapshotConfig::validate`] runs before any
//! network activity.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tonic::transport::Uri;

use crate::error::{Error, Result};
pub use crate::pki::csr::KeyAlgorithm;

/// Default istiod discovery endpoint (also serves certificate issuance)
pub const DEFAULT_DISCOVERY_ENDPOINT: &str = "https://istiod.istio-system.svc:15012";

/// Name istiod's serving certificate is issued for
pub const DEFAULT_SERVER_NAME: &str = "istiod.istio-system.svc";

/// Cluster identifier sent with issuance calls and in node metadata
pub const DEFAULT_CLUSTER_ID: &str = "Kubernetes";

/// Default SPIFFE trust domain
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Requested certificate lifetime
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(3600);

/// Port istiod serves xDS and CA on
pub const DEFAULT_ISTIOD_PORT: u16 = 15012;

/// An `https://host:port` endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    host: String,
    port: u16,
}

impl ServiceEndpoint {
    /// Parse an https URL; a missing port defaults to 15012
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::configuration(format!("invalid endpoint '{}': {}", url, e)))?;

        match uri.scheme_str() {
            Some("https") => {}
            Some(other) => {
                return Err(Error::configuration(format!(
                    "endpoint '{}' must use https, not {}",
                    url, other
                )))
            }
            None => {
                return Err(Error::configuration(format!(
                    "endpoint '{}' must be an https:// URL",
                    url
                )))
            }
        }

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::configuration(format!("endpoint '{}' has no host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        if uri.path() != "/" && !uri.path().is_empty() {
            return Err(Error::configuration(format!(
                "endpoint '{}' must not carry a path",
                url
            )));
        }

        Ok(Self {
            host,
            port: uri.port_u16().unwrap_or(DEFAULT_ISTIOD_PORT),
        })
    }

    /// Host name or IP literal, without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, IPv6 literals bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "https://{}", self.authority())
    }
}

impl FromStr for ServiceEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// How long to wait for an issued certificate whose `NotBefore` is ahead of
/// the local clock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockSkewPolicy {
    /// Largest skew that is waited out; anything beyond fails the run
    pub max_skew: Duration,
    /// How often to re-check the clock while waiting
    pub poll_interval: Duration,
}

impl Default for ClockSkewPolicy {
    fn default() -> Self {
        Self {
            max_skew: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Configuration for one bootstrap + snapshot run
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Discovery (ADS) endpoint
    pub discovery: ServiceEndpoint,
    /// Certificate issuance endpoint; defaults to the discovery endpoint
    pub issuance: Option<ServiceEndpoint>,
    /// Name expected in the control plane's serving certificate
    pub server_name: String,
    /// Cluster identifier for issuance metadata and node metadata
    pub cluster_id: String,
    /// SPIFFE trust domain of the workload identity
    pub trust_domain: String,
    /// Requested lifetime of the issued certificate
    pub cert_ttl: Duration,
    /// Workload key algorithm
    pub key_algorithm: KeyAlgorithm,
    /// Clock skew tolerance for the issued certificate
    pub clock_skew: ClockSkewPolicy,
    /// TCP + TLS connect timeout
    pub connect_timeout: Duration,
    /// Timeout for each RPC response
    pub response_timeout: Duration,
    /// Consult the platform trust store before the pinned anchor
    pub use_system_roots: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            discovery: ServiceEndpoint {
                host: DEFAULT_SERVER_NAME.to_string(),
                port: DEFAULT_ISTIOD_PORT,
            },
            issuance: None,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            cert_ttl: DEFAULT_CERT_TTL,
            key_algorithm: KeyAlgorithm::default(),
            clock_skew: ClockSkewPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            use_system_roots: true,
        }
    }
}

impl SnapshotConfig {
    /// Endpoint certificate issuance calls go to
    pub fn issuance_endpoint(&self) -> &ServiceEndpoint {
        self.issuance.as_ref().unwrap_or(&self.discovery)
    }

    /// Reject configurations that cannot possibly work
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(Error::configuration("server name must not be empty"));
        }
        ServerName::try_from(self.server_name.as_str()).map_err(|e| {
            Error::configuration(format!("invalid server name '{}': {}", self.server_name, e))
        })?;

        if self.cluster_id.is_empty() {
            return Err(Error::configuration("cluster id must not be empty"));
        }
        if self.trust_domain.is_empty() {
            return Err(Error::configuration("trust domain must not be empty"));
        }
        if self.cert_ttl.as_secs() == 0 {
            return Err(Error::configuration(
                "certificate TTL must be at least one second",
            ));
        }
        if self.connect_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(Error::configuration("timeouts must be non-zero"));
        }
        if !self.clock_skew.max_skew.is_zero() && self.clock_skew.poll_interval.is_zero() {
            return Err(Error::configuration(
                "clock skew poll interval must be non-zero",
            ));
        }

        Ok(())
    }
}
