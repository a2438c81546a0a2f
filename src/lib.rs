//! xds-snapshot - inspect the proxy configuration an Istio control plane
//! computes for a node
//!
//! A run bootstraps a workload certificate from istiod's CA and then uses it
//! to fetch a one-shot snapshot over the aggregated discovery service.
//!
//! # Flow
//!
//! ```text
//! token + CSR ──► IstioCertificateService ──► issued chain (pinned-anchor check)
//!                                                   │
//!                                                   ▼
//!            mTLS ADS stream ◄── client credential
//!                 │
//!                 ▼
//!   clusters → endpoints(service names) → listeners → routes(RDS names)
//! ```
//!
//! Both TLS connections and the issued chain are validated against one pinned
//! trust anchor.
//!
//! # Modules
//!
//! - [`pki`] - CSR generation, SPIFFE identities, pinned-anchor chain validation
//! - [`identity`] - Certificate bootstrap against istiod's CA
//! - [`transport`] - TLS channels to the control plane
//! - [`xds`] - ADS client, resource types and name dependencies
//! - [`session`] - One bootstrap + snapshot run
//! - [`k8s`] - Trust anchor and token sources
//! - [`node`] - Proxy node identifiers
//! - [`output`] - Snapshot rendering
//! - [`cli`] - Command-line surface
//! - [`config`] - Run configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod k8s;
pub mod node;
pub mod output;
pub mod pki;
pub mod proto;
pub mod session;
pub mod transport;
pub mod xds;

pub use error::{Error, ErrorCategory, Result};
