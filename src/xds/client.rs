//! ADS stream handling

use std::time::Duration;

use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::protobuf::{value::Kind, Struct, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, info, warn};

use super::types::{decode_resource, Resource};
use super::Batch;
use crate::error::{Error, Result};
use crate::transport::{until_cancelled, with_deadline};

/// Node metadata key istiod reads the cluster id from
pub const CLUSTER_ID_METADATA_KEY: &str = "CLUSTER_ID";

const REQUEST_BUFFER: usize = 4;

/// Node description sent with every request
pub fn node_for(node_id: &str, cluster_id: &str) -> Node {
    let mut metadata = Struct::default();
    metadata.fields.insert(
        CLUSTER_ID_METADATA_KEY.to_string(),
        Value {
            kind: Some(Kind::StringValue(cluster_id.to_string())),
        },
    );

    Node {
        id: node_id.to_string(),
        metadata: Some(metadata),
        ..Default::default()
    }
}

/// Client for one ADS stream
///
/// The stream is opened lazily by the first [`fetch`](Self::fetch) with that
/// request already queued, since some servers send response headers only
/// after the first message arrives.
pub struct DiscoveryClient {
    client: AggregatedDiscoveryServiceClient<Channel>,
    node: Node,
    requests: mpsc::Sender<DiscoveryRequest>,
    outbound: Option<mpsc::Receiver<DiscoveryRequest>>,
    responses: Option<Streaming<DiscoveryResponse>>,
    response_timeout: Duration,
}

impl DiscoveryClient {
    /// Create a client over an established (authenticated) channel
    pub fn new(channel: Channel, node: Node, response_timeout: Duration) -> Self {
        let (requests, outbound) = mpsc::channel(REQUEST_BUFFER);
        Self {
            client: AggregatedDiscoveryServiceClient::new(channel),
            node,
            requests,
            outbound: Some(outbound),
            responses: None,
            response_timeout,
        }
    }

    /// Request resources of type `T` and wait for exactly one response
    ///
    /// `names` of `None` asks for every resource of the type; `Some` filters
    /// to exactly those names, even when empty.
    pub async fn fetch<T: Resource>(
        &mut self,
        names: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<Batch<T>> {
        let kind = T::TYPE;
        let request = DiscoveryRequest {
            node: Some(self.node.clone()),
            type_url: kind.type_url().to_string(),
            resource_names: names.map(<[String]>::to_vec).unwrap_or_default(),
            ..Default::default()
        };

        info!(
            resource_type = %kind,
            names = ?names,
            "Requesting resources"
        );
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::transport("discovery stream closed before request was sent"))?;

        let timeout = self.response_timeout;
        let what = format!("{} response", kind);
        let response =
            until_cancelled(cancel, with_deadline(timeout, &what, self.next_response())).await?;

        if response.type_url != kind.type_url() {
            return Err(Error::protocol(format!(
                "requested {} but received type '{}'",
                kind.type_url(),
                response.type_url
            )));
        }

        let mut batch = Batch {
            requested: names.map(<[String]>::to_vec),
            version_info: response.version_info,
            nonce: response.nonce,
            ..Default::default()
        };
        for (index, any) in response.resources.iter().enumerate() {
            match decode_resource::<T>(index, any) {
                Ok(resource) => batch.resources.push(resource),
                Err(e) => {
                    warn!(resource_type = %kind, index, error = %e.reason, "Failed to decode resource");
                    batch.errors.push(e);
                }
            }
        }

        info!(
            resource_type = %kind,
            version = %batch.version_info,
            resources = batch.resources.len(),
            decode_errors = batch.errors.len(),
            "Received resources"
        );
        Ok(batch)
    }

    async fn next_response(&mut self) -> Result<DiscoveryResponse> {
        if self.responses.is_none() {
            let outbound = self
                .outbound
                .take()
                .ok_or_else(|| Error::transport("discovery stream already failed to open"))?;
            debug!("Opening aggregated discovery stream");
            let stream = self
                .client
                .stream_aggregated_resources(ReceiverStream::new(outbound))
                .await?
                .into_inner();
            self.responses = Some(stream);
        }

        let responses = self
            .responses
            .as_mut()
            .ok_or_else(|| Error::transport("discovery stream is not open"))?;

        responses
            .message()
            .await?
            .ok_or_else(|| Error::transport("discovery stream closed by server"))
    }
}
