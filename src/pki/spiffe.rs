//! SPIFFE workload identity

use std::fmt;
use std::str::FromStr;

use super::{PkiError, Result};

const SCHEME: &str = "spiffe://";

/// Identity URI of a Kubernetes workload: `spiffe://<td>/ns/<namespace>/sa/<service-account>`
///
/// Constructed once per run and never mutated. Every component is checked
/// against the SPIFFE character set so the URI is always a valid IA5 string
/// for the CSR's subject alternative name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadIdentity {
    uri: String,
    trust_domain: String,
    namespace: String,
    service_account: String,
}

impl WorkloadIdentity {
    /// Build the identity for a service account in a namespace
    pub fn new(trust_domain: &str, namespace: &str, service_account: &str) -> Result<Self> {
        validate_trust_domain(trust_domain)?;
        validate_segment("namespace", namespace)?;
        validate_segment("service account", service_account)?;

        Ok(Self {
            uri: format!(
                "{}{}/ns/{}/sa/{}",
                SCHEME, trust_domain, namespace, service_account
            ),
            trust_domain: trust_domain.to_string(),
            namespace: namespace.to_string(),
            service_account: service_account.to_string(),
        })
    }

    /// The full identity URI
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// Trust domain, e.g. `cluster.local`
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Kubernetes namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Kubernetes service account
    pub fn service_account(&self) -> &str {
        &self.service_account
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl FromStr for WorkloadIdentity {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| PkiError::InvalidIdentity(format!("{s}: missing spiffe:// scheme")))?;

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [td, "ns", ns, "sa", sa] => Self::new(td, ns, sa),
            _ => Err(PkiError::InvalidIdentity(format!(
                "{s}: expected spiffe://<trust-domain>/ns/<namespace>/sa/<service-account>"
            ))),
        }
    }
}

fn validate_trust_domain(td: &str) -> Result<()> {
    if td.is_empty() {
        return Err(PkiError::InvalidIdentity(
            "trust domain must not be empty".to_string(),
        ));
    }
    let valid = td
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
    if !valid {
        return Err(PkiError::InvalidIdentity(format!(
            "trust domain '{td}' may only contain lowercase letters, digits, '.', '-' and '_'"
        )));
    }
    Ok(())
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PkiError::InvalidIdentity(format!("{what} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(PkiError::InvalidIdentity(format!(
            "{what} '{value}' is not a valid path segment"
        )));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid {
        return Err(PkiError::InvalidIdentity(format!(
            "{what} '{value}' may only contain letters, digits, '.', '-' and '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_uri_has_kubernetes_shape() {
        let id = WorkloadIdentity::new("cluster.local", "bookinfo", "bookinfo-productpage").unwrap();

        assert_eq!(
            id.as_str(),
            "spiffe://cluster.local/ns/bookinfo/sa/bookinfo-productpage"
        );
        assert_eq!(id.trust_domain(), "cluster.local");
        assert_eq!(id.namespace(), "bookinfo");
        assert_eq!(id.service_account(), "bookinfo-productpage");
        assert_eq!(id.to_string(), id.as_str());
    }

    #[test]
    fn parse_accepts_what_display_produces() {
        let id = WorkloadIdentity::new("example.org", "default", "sleep").unwrap();

        let parsed: WorkloadIdentity = id.to_string().parse().unwrap();

        assert_eq!(parsed, id);
    }

    #[test]
    fn empty_components_are_rejected() {
        assert!(WorkloadIdentity::new("", "default", "sleep").is_err());
        assert!(WorkloadIdentity::new("cluster.local", "", "sleep").is_err());
        assert!(WorkloadIdentity::new("cluster.local", "default", "").is_err());
    }

    #[test]
    fn path_separators_cannot_smuggle_extra_segments() {
        let result = WorkloadIdentity::new("cluster.local", "default/sa/admin", "sleep");

        assert!(matches!(result, Err(PkiError::InvalidIdentity(_))));
    }

    #[test]
    fn uppercase_trust_domain_is_rejected() {
        assert!(WorkloadIdentity::new("Cluster.Local", "default", "sleep").is_err());
    }

    #[test]
    fn parse_rejects_other_shapes() {
        assert!("https://cluster.local/ns/a/sa/b"
            .parse::<WorkloadIdentity>()
            .is_err());
        assert!("spiffe://cluster.local/ns/a".parse::<WorkloadIdentity>().is_err());
        assert!("spiffe://cluster.local/sa/b/ns/a"
            .parse::<WorkloadIdentity>()
            .is_err());
    }
}
