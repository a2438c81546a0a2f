//! Proxy node identifiers
//!
//! istiod identifies proxies by `role~ip~pod.namespace~namespace.svc.domain`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Role a proxy plays in the mesh
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProxyRole {
    /// Sidecar next to an application container
    #[default]
    Sidecar,
    /// Standalone gateway
    Router,
}

impl ProxyRole {
    /// Wire form of the role
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyRole::Sidecar => "sidecar",
            ProxyRole::Router => "router",
        }
    }
}

impl fmt::Display for ProxyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sidecar" => Ok(ProxyRole::Sidecar),
            "router" => Ok(ProxyRole::Router),
            other => Err(Error::configuration(format!(
                "unknown proxy role '{}', expected sidecar or router",
                other
            ))),
        }
    }
}

/// Identifier of the proxy whose configuration is fetched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeId(String);

impl NodeId {
    /// Build the id istiod expects for a pod
    pub fn for_pod(
        role: ProxyRole,
        ip: IpAddr,
        pod: &str,
        namespace: &str,
        dns_domain: &str,
    ) -> Result<Self> {
        for (what, value) in [("pod", pod), ("namespace", namespace), ("DNS domain", dns_domain)] {
            if value.is_empty() {
                return Err(Error::configuration(format!("{} must not be empty", what)));
            }
            if value.contains('~') {
                return Err(Error::configuration(format!(
                    "{} '{}' must not contain '~'",
                    what, value
                )));
            }
        }

        Ok(Self(format!(
            "{}~{}~{}.{}~{}.svc.{}",
            role, ip, pod, namespace, namespace, dns_domain
        )))
    }

    /// Use an operator-supplied id verbatim
    pub fn raw(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::configuration("node id must not be empty"));
        }
        Ok(Self(id))
    }

    /// The id as sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
