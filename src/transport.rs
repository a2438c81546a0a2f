//! TLS channels to the control plane
//!
//! Both outbound connections of a run (issuance, then discovery) go through
//! [`ChannelFactory`]. TLS is done by our own connector rather than tonic's so
//! the server certificate is checked by [`PinnedAnchorVerifier`] and a
//! handshake rejected for trust reasons can be told apart from a network
//! failure.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, info};

use crate::config::{ServiceEndpoint, SnapshotConfig};
use crate::error::{Error, Result};
use crate::identity::IssuedCredential;
use crate::pki::verifier::{platform_verifier, rejection_from};
use crate::pki::{ChainRejection, ChainValidator, PinnedAnchorVerifier};

/// Builds TLS channels that trust only the pinned anchor (and, optionally,
/// the platform store)
#[derive(Clone)]
pub struct ChannelFactory {
    verifier: Arc<PinnedAnchorVerifier>,
    provider: Arc<CryptoProvider>,
    server_name: ServerName<'static>,
    connect_timeout: Duration,
}

impl ChannelFactory {
    /// Create a factory from the shared validator and run configuration
    pub fn new(validator: Arc<ChainValidator>, config: &SnapshotConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let platform: Option<Arc<WebPkiServerVerifier>> = if config.use_system_roots {
            platform_verifier(provider.clone())
        } else {
            None
        };

        let server_name = ServerName::try_from(config.server_name.clone()).map_err(|e| {
            Error::configuration(format!(
                "invalid server name '{}': {}",
                config.server_name, e
            ))
        })?;

        Ok(Self {
            verifier: Arc::new(PinnedAnchorVerifier::new(
                validator,
                platform,
                provider.clone(),
            )),
            provider,
            server_name,
            connect_timeout: config.connect_timeout,
        })
    }

    /// Open a channel, presenting `client` as the TLS client certificate
    /// when given
    ///
    /// Connects eagerly so handshake failures surface here: a certificate
    /// rejected by the pinned-anchor check is [`Error::Untrusted`], anything
    /// else is [`Error::Transport`].
    pub async fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        client: Option<&IssuedCredential>,
    ) -> Result<Channel> {
        let tls = self.client_config(client)?;
        let authority = endpoint.authority();
        let rejection = RejectionSlot::default();

        info!(
            endpoint = %endpoint,
            server_name = %self.server_name.to_str(),
            mtls = client.is_some(),
            "Connecting to control plane"
        );

        let connector = TlsConnector::from(Arc::new(tls));
        let server_name = self.server_name.clone();
        let connect_timeout = self.connect_timeout;
        let target = authority.clone();
        let slot = rejection.clone();

        let service = tower::service_fn(move |_: Uri| {
            let connector = connector.clone();
            let server_name = server_name.clone();
            let target = target.clone();
            let slot = slot.clone();
            async move {
                let handshake = async {
                    let tcp = TcpStream::connect(&target).await?;
                    tcp.set_nodelay(true)?;
                    connector.connect(server_name, tcp).await.inspect_err(|e| {
                        slot.record(e);
                    })
                };
                let stream = tokio::time::timeout(connect_timeout, handshake)
                    .await
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("TLS connect to {} timed out", target),
                        )
                    })??;
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        });

        // The connector does TLS itself; tonic must not see an https URI
        let channel = Endpoint::from_shared(format!("http://{}", authority))
            .map_err(|e| Error::configuration(format!("invalid endpoint {}: {}", endpoint, e)))?
            .connect_with_connector(service)
            .await;

        match channel {
            Ok(channel) => {
                debug!(endpoint = %endpoint, "Channel established");
                Ok(channel)
            }
            Err(e) => match rejection.take() {
                Some(rejection) => Err(Error::untrusted(format!(
                    "{} presented a certificate that is not trusted: {}",
                    endpoint, rejection
                ))),
                None => Err(Error::transport(format!(
                    "failed to connect to {}: {}",
                    endpoint,
                    error_chain(&e)
                ))),
            },
        }
    }

    fn client_config(&self, client: Option<&IssuedCredential>) -> Result<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::configuration(format!("TLS protocol setup failed: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(self.verifier.clone());

        let mut config = match client {
            Some(credential) => builder
                .with_client_auth_cert(credential.certificate_chain(), credential.private_key())
                .map_err(|e| {
                    Error::configuration(format!("unusable client credential: {}", e))
                })?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(config)
    }
}

/// Holds the chain rejection from a failed handshake, if any
#[derive(Clone, Default)]
struct RejectionSlot(Arc<Mutex<Option<ChainRejection>>>);

impl RejectionSlot {
    fn record(&self, err: &io::Error) {
        let rejection = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .and_then(rejection_from);

        if let (Some(rejection), Ok(mut slot)) = (rejection, self.0.lock()) {
            *slot = Some(rejection.clone());
        }
    }

    fn take(&self) -> Option<ChainRejection> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Render an error with all of its sources
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

/// Run `fut` unless the run is cancelled first
pub async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Aborted),
        result = fut => result,
    }
}

/// Run `fut` with a deadline, naming `what` in the timeout error
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| {
            Error::transport(format!(
                "timed out after {:?} waiting for {}",
                deadline, what
            ))
        })?
}
