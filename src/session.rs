//! One run: bootstrap, connect, snapshot
//!
//! Everything is sequential. The credential is threaded from the bootstrap
//! into the discovery channel and dropped once that channel is up. The TLS
//! config inside the channel keeps its own copy of the private key, so the
//! key stays in memory until the channel itself is dropped at the end of the
//! run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::identity::{BearerToken, IdentityBootstrapper};
use crate::k8s::IdentitySource;
use crate::node::NodeId;
use crate::pki::{ChainValidator, TrustAnchor, WorkloadIdentity};
use crate::transport::{until_cancelled, ChannelFactory};
use crate::xds::{fetch_snapshot, node_for, DiscoveryClient, ResourceSnapshot};

/// What a run needs besides configuration
#[derive(Debug)]
pub struct RunInputs {
    /// Proxy the configuration is fetched for
    pub node_id: NodeId,
    /// Identity the client certificate is requested for
    pub identity: WorkloadIdentity,
    /// Root pinned for both TLS connections and the issued chain
    pub anchor: TrustAnchor,
    /// Token presented to the issuance service
    pub token: BearerToken,
}

/// Collect the anchor and token for `identity` from `source`
pub async fn gather_inputs(
    source: &dyn IdentitySource,
    node_id: NodeId,
    identity: WorkloadIdentity,
    cancel: &CancellationToken,
) -> Result<RunInputs> {
    let anchor = until_cancelled(cancel, source.trust_anchor()).await?;
    let token = until_cancelled(cancel, source.token(&identity)).await?;

    Ok(RunInputs {
        node_id,
        identity,
        anchor,
        token,
    })
}

/// Bootstrap an identity and fetch the node's configuration
pub async fn take_snapshot(
    config: &SnapshotConfig,
    inputs: RunInputs,
    cancel: &CancellationToken,
) -> Result<ResourceSnapshot> {
    config.validate()?;

    let RunInputs {
        node_id,
        identity,
        anchor,
        token,
    } = inputs;

    info!(
        node = %node_id,
        identity = %identity,
        anchor = %anchor.fingerprint(),
        "Starting snapshot run"
    );

    let validator = Arc::new(ChainValidator::new(anchor));
    let channels = ChannelFactory::new(validator.clone(), config)?;

    let bootstrapper = IdentityBootstrapper::new(channels.clone(), validator, config);
    let credential = bootstrapper
        .bootstrap(&identity, config.issuance_endpoint(), &token, cancel)
        .await?;
    drop(token);

    let channel =
        until_cancelled(cancel, channels.connect(&config.discovery, Some(&credential))).await?;
    drop(credential);

    let node = node_for(node_id.as_str(), &config.cluster_id);
    let mut client = DiscoveryClient::new(channel, node, config.response_timeout);
    let snapshot = fetch_snapshot(&mut client, cancel).await?;

    info!(
        clusters = snapshot.clusters.resources.len(),
        endpoints = snapshot.endpoints.resources.len(),
        listeners = snapshot.listeners.resources.len(),
        routes = snapshot.routes.resources.len(),
        decode_errors = snapshot.decode_errors().count(),
        "Snapshot complete"
    );
    Ok(snapshot)
}
