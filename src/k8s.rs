//! Where the trust anchor and the bearer token come from
//!
//! In cluster both are read through the Kubernetes API: the anchor from
//! istiod's CA secret (or the root-cert config map it publishes), the token
//! through the TokenRequest API. Either can be overridden by a file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use kube::api::PostParams;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::BearerToken;
use crate::pki::{TrustAnchor, WorkloadIdentity};

/// Namespace istiod runs in
pub const ISTIO_NAMESPACE: &str = "istio-system";

/// Secret holding istiod's self-signed CA
pub const CA_SECRET: &str = "istio-ca-secret";

/// Key of the CA certificate in [`CA_SECRET`]
pub const CA_SECRET_KEY: &str = "ca-cert.pem";

/// Config map istiod publishes its root certificate in
pub const ROOT_CERT_CONFIG_MAP: &str = "istio-ca-root-cert";

/// Key of the root certificate in [`ROOT_CERT_CONFIG_MAP`]
pub const ROOT_CERT_KEY: &str = "root-cert.pem";

/// Audience istiod's CA accepts tokens for
pub const TOKEN_AUDIENCE: &str = "istio-ca";

/// Lifetime requested for service account tokens
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Inputs the bootstrap needs from outside the process
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// The root certificate to pin
    async fn trust_anchor(&self) -> Result<TrustAnchor>;

    /// A bearer token for `identity`'s service account
    async fn token(&self, identity: &WorkloadIdentity) -> Result<BearerToken>;
}

/// Reads the anchor and token through the Kubernetes API
pub struct KubeIdentitySource {
    client: Client,
    istio_namespace: String,
    token_ttl: Duration,
}

impl KubeIdentitySource {
    /// Create a source over `client`
    pub fn new(client: Client, istio_namespace: impl Into<String>, token_ttl: Duration) -> Self {
        Self {
            client,
            istio_namespace: istio_namespace.into(),
            token_ttl,
        }
    }

    async fn anchor_from_secret(&self) -> Result<Option<TrustAnchor>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.istio_namespace);
        let Some(secret) = secrets.get_opt(CA_SECRET).await? else {
            return Ok(None);
        };

        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(CA_SECRET_KEY))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "secret {}/{} has no '{}' key",
                    self.istio_namespace, CA_SECRET, CA_SECRET_KEY
                ))
            })?;
        let pem = std::str::from_utf8(&data.0).map_err(|_| {
            Error::configuration(format!(
                "secret {}/{} key '{}' is not PEM text",
                self.istio_namespace, CA_SECRET, CA_SECRET_KEY
            ))
        })?;

        parse_anchor(pem, CA_SECRET).map(Some)
    }

    async fn anchor_from_config_map(&self) -> Result<TrustAnchor> {
        let config_maps: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &self.istio_namespace);
        let config_map = config_maps.get(ROOT_CERT_CONFIG_MAP).await?;

        let pem = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(ROOT_CERT_KEY))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "config map {}/{} has no '{}' key",
                    self.istio_namespace, ROOT_CERT_CONFIG_MAP, ROOT_CERT_KEY
                ))
            })?;

        parse_anchor(pem, ROOT_CERT_CONFIG_MAP)
    }
}

#[async_trait]
impl IdentitySource for KubeIdentitySource {
    async fn trust_anchor(&self) -> Result<TrustAnchor> {
        let anchor = match self.anchor_from_secret().await? {
            Some(anchor) => anchor,
            None => {
                debug!(
                    namespace = %self.istio_namespace,
                    "CA secret not found, falling back to root cert config map"
                );
                self.anchor_from_config_map().await?
            }
        };

        info!(
            subject = %anchor.subject(),
            fingerprint = %anchor.fingerprint(),
            "Loaded trust anchor from cluster"
        );
        Ok(anchor)
    }

    async fn token(&self, identity: &WorkloadIdentity) -> Result<BearerToken> {
        let accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), identity.namespace());

        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![TOKEN_AUDIENCE.to_string()],
                expiration_seconds: Some(self.token_ttl.as_secs() as i64),
                ..Default::default()
            },
            ..Default::default()
        };

        let issued = accounts
            .create_token_request(identity.service_account(), &PostParams::default(), &request)
            .await?;

        let token = issued
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "token request for {}/{} returned no token",
                    identity.namespace(),
                    identity.service_account()
                ))
            })?;

        info!(
            namespace = %identity.namespace(),
            service_account = %identity.service_account(),
            audience = TOKEN_AUDIENCE,
            "Obtained service account token"
        );
        BearerToken::new(token)
    }
}

/// Reads the anchor and/or token from files, delegating what is not
/// configured to another source
pub struct FileIdentitySource {
    anchor_path: Option<PathBuf>,
    token_path: Option<PathBuf>,
    fallback: Option<Arc<dyn IdentitySource>>,
}

impl FileIdentitySource {
    /// Create a source; unset paths are served by `fallback`
    pub fn new(
        anchor_path: Option<PathBuf>,
        token_path: Option<PathBuf>,
        fallback: Option<Arc<dyn IdentitySource>>,
    ) -> Self {
        Self {
            anchor_path,
            token_path,
            fallback,
        }
    }

    fn fallback(&self, what: &str) -> Result<&Arc<dyn IdentitySource>> {
        self.fallback.as_ref().ok_or_else(|| {
            Error::configuration(format!("no {} file given and no cluster access", what))
        })
    }
}

#[async_trait]
impl IdentitySource for FileIdentitySource {
    async fn trust_anchor(&self) -> Result<TrustAnchor> {
        let Some(path) = &self.anchor_path else {
            return self.fallback("trust anchor")?.trust_anchor().await;
        };

        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration(format!(
                "failed to read trust anchor {}: {}",
                path.display(),
                e
            ))
        })?;
        let anchor = parse_anchor(&pem, &path.display().to_string())?;

        info!(
            path = %path.display(),
            fingerprint = %anchor.fingerprint(),
            "Loaded trust anchor from file"
        );
        Ok(anchor)
    }

    async fn token(&self, identity: &WorkloadIdentity) -> Result<BearerToken> {
        let Some(path) = &self.token_path else {
            return self.fallback("token")?.token(identity).await;
        };

        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration(format!("failed to read token {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded token from file");
        BearerToken::new(token)
    }
}

fn parse_anchor(pem: &str, origin: &str) -> Result<TrustAnchor> {
    TrustAnchor::from_pem(pem)
        .map_err(|e| Error::configuration(format!("invalid trust anchor in {}: {}", origin, e)))
}
