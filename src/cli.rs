//! Command-line surface
//!
//! Every flag also reads an `XDS_SNAPSHOT_*` environment variable.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::{
    ClockSkewPolicy, KeyAlgorithm, ServiceEndpoint, SnapshotConfig, DEFAULT_CLUSTER_ID,
    DEFAULT_DISCOVERY_ENDPOINT, DEFAULT_SERVER_NAME, DEFAULT_TRUST_DOMAIN,
};
use crate::error::{Error, Result};
use crate::k8s::ISTIO_NAMESPACE;
use crate::node::{NodeId, ProxyRole};
use crate::output::OutputFormat;
use crate::pki::WorkloadIdentity;

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Key algorithm as spelled on the command line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum KeyAlgorithmArg {
    /// ECDSA over P-256
    #[default]
    EcdsaP256,
    /// ECDSA over P-384
    EcdsaP384,
}

impl From<KeyAlgorithmArg> for KeyAlgorithm {
    fn from(arg: KeyAlgorithmArg) -> Self {
        match arg {
            KeyAlgorithmArg::EcdsaP256 => KeyAlgorithm::EcdsaP256,
            KeyAlgorithmArg::EcdsaP384 => KeyAlgorithm::EcdsaP384,
        }
    }
}

/// xds-snapshot - print the proxy configuration istiod computes for a node
///
/// Bootstraps a workload certificate from istiod's CA, then fetches clusters,
/// endpoints, listeners and routes over ADS.
#[derive(Parser, Debug)]
#[command(name = "xds-snapshot", version, about, long_about = None)]
pub struct Cli {
    /// Discovery (ADS) endpoint
    #[arg(long, env = "XDS_SNAPSHOT_DISCOVERY_ADDRESS", default_value = DEFAULT_DISCOVERY_ENDPOINT)]
    pub discovery_address: ServiceEndpoint,

    /// Certificate issuance endpoint; defaults to the discovery endpoint
    #[arg(long, env = "XDS_SNAPSHOT_CA_ADDRESS")]
    pub ca_address: Option<ServiceEndpoint>,

    /// Name expected in istiod's serving certificate
    #[arg(long, env = "XDS_SNAPSHOT_SERVER_NAME", default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// Cluster id sent to the CA and in node metadata
    #[arg(long, env = "XDS_SNAPSHOT_CLUSTER_ID", default_value = DEFAULT_CLUSTER_ID)]
    pub cluster_id: String,

    /// SPIFFE trust domain
    #[arg(long, env = "XDS_SNAPSHOT_TRUST_DOMAIN", default_value = DEFAULT_TRUST_DOMAIN)]
    pub trust_domain: String,

    /// Namespace of the service account the certificate is issued for
    #[arg(long, env = "XDS_SNAPSHOT_NAMESPACE", default_value = ISTIO_NAMESPACE)]
    pub namespace: String,

    /// Service account the certificate is issued for
    #[arg(long, env = "XDS_SNAPSHOT_SERVICE_ACCOUNT", default_value = "istiod")]
    pub service_account: String,

    /// Namespace istiod's CA secret lives in
    #[arg(long, env = "XDS_SNAPSHOT_ISTIO_NAMESPACE", default_value = ISTIO_NAMESPACE)]
    pub istio_namespace: String,

    /// PEM root certificate to pin instead of reading it from the cluster
    #[arg(long, env = "XDS_SNAPSHOT_TRUST_ANCHOR")]
    pub trust_anchor: Option<PathBuf>,

    /// Token file to use instead of a TokenRequest
    #[arg(long, env = "XDS_SNAPSHOT_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Full node id; overrides the pod-derived one
    #[arg(long, env = "XDS_SNAPSHOT_NODE_ID")]
    pub node_id: Option<String>,

    /// Proxy role for the derived node id
    #[arg(long, env = "XDS_SNAPSHOT_ROLE", default_value = "sidecar")]
    pub role: ProxyRole,

    /// Pod IP for the derived node id
    #[arg(long, env = "XDS_SNAPSHOT_POD_IP", default_value = "127.0.0.1")]
    pub pod_ip: IpAddr,

    /// Pod name for the derived node id
    #[arg(long, env = "XDS_SNAPSHOT_POD_NAME", default_value = "xds-snapshot")]
    pub pod_name: String,

    /// Pod namespace for the derived node id
    #[arg(long, env = "XDS_SNAPSHOT_POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Cluster DNS domain for the derived node id
    #[arg(long, env = "XDS_SNAPSHOT_DNS_DOMAIN", default_value = "cluster.local")]
    pub dns_domain: String,

    /// Requested certificate lifetime in seconds
    #[arg(long, env = "XDS_SNAPSHOT_CERT_TTL_SECS", default_value = "3600")]
    pub cert_ttl_secs: u64,

    /// Workload key algorithm
    #[arg(long, env = "XDS_SNAPSHOT_KEY_ALGORITHM", value_enum, default_value_t)]
    pub key_algorithm: KeyAlgorithmArg,

    /// Largest clock skew on the issued certificate that is waited out, in seconds
    #[arg(long, env = "XDS_SNAPSHOT_MAX_CLOCK_SKEW_SECS", default_value = "10")]
    pub max_clock_skew_secs: u64,

    /// Connect timeout in seconds
    #[arg(long, env = "XDS_SNAPSHOT_CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Per-response timeout in seconds
    #[arg(long, env = "XDS_SNAPSHOT_RESPONSE_TIMEOUT_SECS", default_value = "30")]
    pub response_timeout_secs: u64,

    /// Trust only the pinned anchor, not the platform trust store
    #[arg(long, env = "XDS_SNAPSHOT_NO_SYSTEM_ROOTS")]
    pub no_system_roots: bool,

    /// Output format
    #[arg(long, env = "XDS_SNAPSHOT_OUTPUT", value_enum, default_value_t)]
    pub output: OutputFormat,

    /// Log format (logs go to stderr)
    #[arg(long, env = "XDS_SNAPSHOT_LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Run configuration described by the flags
    pub fn config(&self) -> SnapshotConfig {
        SnapshotConfig {
            discovery: self.discovery_address.clone(),
            issuance: self.ca_address.clone(),
            server_name: self.server_name.clone(),
            cluster_id: self.cluster_id.clone(),
            trust_domain: self.trust_domain.clone(),
            cert_ttl: Duration::from_secs(self.cert_ttl_secs),
            key_algorithm: self.key_algorithm.into(),
            clock_skew: ClockSkewPolicy {
                max_skew: Duration::from_secs(self.max_clock_skew_secs),
                ..ClockSkewPolicy::default()
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            use_system_roots: !self.no_system_roots,
        }
    }

    /// Identity the certificate is requested for
    pub fn identity(&self) -> Result<WorkloadIdentity> {
        WorkloadIdentity::new(&self.trust_domain, &self.namespace, &self.service_account)
            .map_err(|e| Error::configuration(e.to_string()))
    }

    /// Node the snapshot is taken for
    pub fn node_id(&self) -> Result<NodeId> {
        match &self.node_id {
            Some(raw) => NodeId::raw(raw.clone()),
            None => NodeId::for_pod(
                self.role,
                self.pod_ip,
                &self.pod_name,
                &self.pod_namespace,
                &self.dns_domain,
            ),
        }
    }

    /// Whether the cluster API is needed to fill in the inputs
    pub fn needs_cluster(&self) -> bool {
        self.trust_anchor.is_none() || self.token_file.is_none()
    }
}
