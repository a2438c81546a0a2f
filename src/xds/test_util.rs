//! In-process ADS server for tests
//!
//! Answers every request with the canned response for its type URL (an empty
//! response when none was configured) and records what was asked.
#![allow(missing_docs)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::google::protobuf::Any;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};

use super::types::ResourceType;

#[derive(Clone, Default)]
pub struct StubAds {
    responses: HashMap<String, DiscoveryResponse>,
    requests: Arc<Mutex<Vec<DiscoveryRequest>>>,
    client_cert_presented: Arc<Mutex<Option<bool>>>,
}

impl StubAds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests for `kind` with these resources
    pub fn with_resources(self, kind: ResourceType, resources: Vec<Any>) -> Self {
        let response = DiscoveryResponse {
            type_url: kind.type_url().to_string(),
            version_info: "2024-01-01T00:00:00Z/1".to_string(),
            resources,
            ..Default::default()
        };
        self.with_response(kind, response)
    }

    /// Answer requests for `kind` with exactly this response
    pub fn with_response(mut self, kind: ResourceType, response: DiscoveryResponse) -> Self {
        self.responses.insert(kind.type_url().to_string(), response);
        self
    }

    /// Requests received so far, in arrival order
    pub fn requests(&self) -> Vec<DiscoveryRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Whether the last stream was opened with a client certificate
    pub fn client_cert_presented(&self) -> Option<bool> {
        self.client_cert_presented.lock().ok().and_then(|p| *p)
    }

    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    fn respond_to(&self, request: &DiscoveryRequest, nonce: usize) -> DiscoveryResponse {
        let mut response = self
            .responses
            .get(&request.type_url)
            .cloned()
            .unwrap_or_else(|| DiscoveryResponse {
                type_url: request.type_url.clone(),
                version_info: "2024-01-01T00:00:00Z/1".to_string(),
                ..Default::default()
            });
        response.nonce = nonce.to_string();
        response
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for StubAds {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;
    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let presented = request.peer_certs().is_some_and(|certs| !certs.is_empty());
        if let Ok(mut slot) = self.client_cert_presented.lock() {
            *slot = Some(presented);
        }

        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(8);
        let stub = self.clone();

        tokio::spawn(async move {
            let mut nonce = 0;
            while let Some(Ok(request)) = inbound.next().await {
                nonce += 1;
                let response = stub.respond_to(&request, nonce);
                if let Ok(mut log) = stub.requests.lock() {
                    log.push(request);
                }
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not served"))
    }
}

/// Serve `stub` without TLS on an ephemeral port
pub async fn serve_plaintext(stub: StubAds) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(stub.into_service())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });

    Ok(addr)
}
