//! Error types for a snapshot run

use std::time::Duration;

use thiserror::Error;

/// Main error type for bootstrap and discovery operations
///
/// Every variant is fatal for the run. Per-resource decode failures are not
/// errors of this type; they travel alongside the decoded resources as
/// [`crate::xds::DecodeError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid anchor, identity, endpoint or key material
    #[error("configuration error: {0}")]
    Configuration(String),

    /// RPC or stream failure talking to istiod
    #[error("transport error: {0}")]
    Transport(String),

    /// A certificate chain does not terminate at the pinned trust anchor
    #[error("certificate not trusted: {0}")]
    Untrusted(String),

    /// The issued certificate starts too far in the future to wait for
    #[error("clock skew: issued certificate becomes valid in {skew:?}, more than the {limit:?} tolerated")]
    ClockSkew {
        /// How far ahead of the local clock the certificate starts
        skew: Duration,
        /// Largest skew that would have been waited out
        limit: Duration,
    },

    /// The discovery service answered with something other than what was asked
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The run was cancelled while waiting on the network
    #[error("run aborted")]
    Aborted,

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] for operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fix the inputs; nothing touched the network
    Configuration,
    /// Check reachability and credentials of the control plane
    Transport,
    /// Check the trust anchor or the issuer's signing key
    Trust,
    /// Check the local clock
    ClockSkew,
    /// The run was cancelled
    Aborted,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a trust error with the given message
    pub fn untrusted(msg: impl Into<String>) -> Self {
        Self::Untrusted(msg.into())
    }

    /// Create a protocol error with the given message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Which family of failure this is
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration(_) => ErrorCategory::Configuration,
            Error::Transport(_) | Error::Protocol(_) | Error::Kube(_) => ErrorCategory::Transport,
            Error::Untrusted(_) => ErrorCategory::Trust,
            Error::ClockSkew { .. } => ErrorCategory::ClockSkew,
            Error::Aborted => ErrorCategory::Aborted,
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Self::Transport(format!("{}: {}", status.code(), status.message()))
    }
}
