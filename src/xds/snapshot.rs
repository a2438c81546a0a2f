//! The four-step dependent fetch

use std::collections::BTreeSet;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::client::DiscoveryClient;
use super::deps::{endpoint_service_names, route_config_names};
use super::{Batch, DecodeError};
use crate::error::Result;

/// Configuration computed for one proxy node
#[derive(Clone, Debug, Default)]
pub struct ResourceSnapshot {
    /// All clusters
    pub clusters: Batch<Cluster>,
    /// Endpoint assignments for the clusters' service names
    pub endpoints: Batch<ClusterLoadAssignment>,
    /// All listeners
    pub listeners: Batch<Listener>,
    /// Route configurations the listeners delegate to
    pub routes: Batch<RouteConfiguration>,
}

impl ResourceSnapshot {
    /// Every decode error across all four kinds
    pub fn decode_errors(&self) -> impl Iterator<Item = &DecodeError> {
        self.clusters
            .errors
            .iter()
            .chain(&self.endpoints.errors)
            .chain(&self.listeners.errors)
            .chain(&self.routes.errors)
    }

    /// True when every returned resource decoded
    pub fn is_complete(&self) -> bool {
        self.decode_errors().next().is_none()
    }
}

/// Fetch clusters, endpoints, listeners and routes, in that order
///
/// Endpoint and route requests are filtered to the names derived from the
/// cluster and listener responses; an empty derived list is still sent as
/// an explicit filter.
pub async fn fetch_snapshot(
    client: &mut DiscoveryClient,
    cancel: &CancellationToken,
) -> Result<ResourceSnapshot> {
    let clusters = client.fetch::<Cluster>(None, cancel).await?;

    let service_names = endpoint_service_names(&clusters.resources);
    info!(names = ?service_names, "Derived endpoint service names from clusters");
    let endpoints = client
        .fetch::<ClusterLoadAssignment>(Some(&service_names), cancel)
        .await?;

    let mut listeners = client.fetch::<Listener>(None, cancel).await?;

    let derived = route_config_names(&listeners.resources);
    info!(names = ?derived.names, "Derived route configuration names from listeners");
    let positions = response_positions(&listeners);
    listeners
        .errors
        .extend(derived.errors.into_iter().map(|mut error| {
            error.index = positions.get(error.index).copied().unwrap_or(error.index);
            error
        }));
    listeners.errors.sort_by_key(|error| error.index);

    let routes = client
        .fetch::<RouteConfiguration>(Some(&derived.names), cancel)
        .await?;

    Ok(ResourceSnapshot {
        clusters,
        endpoints,
        listeners,
        routes,
    })
}

/// Response position of each decoded resource in `batch`
fn response_positions<T>(batch: &Batch<T>) -> Vec<usize> {
    let failed: BTreeSet<usize> = batch.errors.iter().map(|e| e.index).collect();
    (0..)
        .filter(|index| !failed.contains(index))
        .take(batch.resources.len())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
    use envoy_types::pb::google::protobuf::Any;
    use tonic::transport::Endpoint;

    use super::*;
    use crate::error::Error;
    use crate::xds::client::node_for;
    use crate::xds::deps::fixtures::*;
    use crate::xds::test_util::{serve_plaintext, StubAds};
    use crate::xds::types::{to_any, ResourceType};

    async fn client_for(addr: SocketAddr) -> DiscoveryClient {
        let channel = Endpoint::from_shared(format!("http://{}", addr))
            .unwrap()
            .connect()
            .await
            .unwrap();
        DiscoveryClient::new(
            channel,
            node_for("sidecar~10.1.2.3~sleep-abc.default~default.svc.cluster.local", "Kubernetes"),
            Duration::from_secs(5),
        )
    }

    fn mesh() -> StubAds {
        StubAds::new()
            .with_resources(
                ResourceType::Cluster,
                vec![
                    to_any(&eds_cluster("outbound|80||reviews", "reviews")),
                    to_any(&eds_cluster("outbound|80||ratings", "ratings")),
                    to_any(&static_cluster("BlackHoleCluster")),
                ],
            )
            .with_resources(
                ResourceType::Listener,
                vec![
                    to_any(&rds_listener(
                        "0.0.0.0_9080",
                        "envoy.filters.network.http_connection_manager",
                        "9080",
                    )),
                    to_any(&inline_route_listener("virtualInbound")),
                ],
            )
    }

    // ==========================================================================
    // Story: a snapshot follows cluster and listener dependencies
    // ==========================================================================

    #[tokio::test]
    async fn requests_are_issued_in_dependency_order() {
        let stub = mesh();
        let addr = serve_plaintext(stub.clone()).await.unwrap();
        let mut client = client_for(addr).await;

        let snapshot = fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap();

        let requests = stub.requests();
        let order: Vec<&str> = requests.iter().map(|r| r.type_url.as_str()).collect();
        assert_eq!(
            order,
            vec![
                ResourceType::Cluster.type_url(),
                ResourceType::Endpoint.type_url(),
                ResourceType::Listener.type_url(),
                ResourceType::Route.type_url(),
            ]
        );
        assert!(requests[0].resource_names.is_empty());
        assert_eq!(requests[1].resource_names, vec!["ratings", "reviews"]);
        assert_eq!(requests[3].resource_names, vec!["9080"]);

        assert_eq!(snapshot.clusters.resources.len(), 3);
        assert_eq!(snapshot.listeners.resources.len(), 2);
        assert_eq!(
            snapshot.endpoints.requested.as_deref(),
            Some(&["ratings".to_string(), "reviews".to_string()][..])
        );
        assert!(snapshot.is_complete());
    }

    #[tokio::test]
    async fn every_request_identifies_the_node() {
        let stub = mesh();
        let addr = serve_plaintext(stub.clone()).await.unwrap();
        let mut client = client_for(addr).await;

        fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap();

        for request in stub.requests() {
            let node = request.node.unwrap();
            assert!(node.id.starts_with("sidecar~10.1.2.3~"));
            assert!(node.metadata.unwrap().fields.contains_key("CLUSTER_ID"));
        }
    }

    #[tokio::test]
    async fn response_bookkeeping_is_recorded() {
        let stub = mesh();
        let addr = serve_plaintext(stub.clone()).await.unwrap();
        let mut client = client_for(addr).await;

        let snapshot = fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(snapshot.clusters.nonce, "1");
        assert_eq!(snapshot.routes.nonce, "4");
        assert_eq!(snapshot.clusters.version_info, "2024-01-01T00:00:00Z/1");
    }

    // ==========================================================================
    // Story: partial failures and protocol violations
    // ==========================================================================

    #[tokio::test]
    async fn undecodable_resources_do_not_hide_their_siblings() {
        let stub = StubAds::new().with_resources(
            ResourceType::Listener,
            vec![
                to_any(&tcp_proxy_listener("0.0.0.0_3306")),
                Any {
                    type_url: ResourceType::Listener.type_url().to_string(),
                    value: vec![0xff, 0xff, 0xff],
                },
                to_any(&rds_listener(
                    "0.0.0.0_80",
                    "envoy.http_connection_manager",
                    "80",
                )),
            ],
        );
        let addr = serve_plaintext(stub.clone()).await.unwrap();
        let mut client = client_for(addr).await;

        let snapshot = fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(snapshot.listeners.names(), vec!["0.0.0.0_3306", "0.0.0.0_80"]);
        assert_eq!(snapshot.listeners.errors.len(), 1);
        assert_eq!(snapshot.listeners.errors[0].index, 1);
        assert!(!snapshot.is_complete());
        assert_eq!(stub.requests()[3].resource_names, vec!["80"]);
    }

    #[tokio::test]
    async fn unreadable_connection_manager_marks_the_snapshot_incomplete() {
        let stub = StubAds::new().with_resources(
            ResourceType::Listener,
            vec![
                Any {
                    type_url: ResourceType::Listener.type_url().to_string(),
                    value: vec![0xff, 0xff, 0xff],
                },
                to_any(&corrupt_manager_listener("broken")),
                to_any(&rds_listener(
                    "0.0.0.0_80",
                    "envoy.filters.network.http_connection_manager",
                    "80",
                )),
            ],
        );
        let addr = serve_plaintext(stub.clone()).await.unwrap();
        let mut client = client_for(addr).await;

        let snapshot = fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!snapshot.is_complete());
        let indices: Vec<usize> = snapshot.listeners.errors.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(snapshot.listeners.errors[1].reason.contains("'broken'"));
        assert_eq!(snapshot.listeners.names(), vec!["broken", "0.0.0.0_80"]);
        assert_eq!(stub.requests()[3].resource_names, vec!["80"]);
    }

    #[tokio::test]
    async fn no_clusters_means_an_empty_endpoint_filter() {
        let stub = StubAds::new();
        let addr = serve_plaintext(stub.clone()).await.unwrap();
        let mut client = client_for(addr).await;

        let snapshot = fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(snapshot.endpoints.requested, Some(Vec::new()));
        assert_eq!(snapshot.routes.requested, Some(Vec::new()));
        assert_eq!(stub.requests().len(), 4);
    }

    #[tokio::test]
    async fn mismatched_response_type_is_a_protocol_error() {
        let stub = StubAds::new().with_response(
            ResourceType::Cluster,
            DiscoveryResponse {
                type_url: ResourceType::Listener.type_url().to_string(),
                ..Default::default()
            },
        );
        let addr = serve_plaintext(stub).await.unwrap();
        let mut client = client_for(addr).await;

        let err = fetch_snapshot(&mut client, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn cancelled_fetch_is_aborted() {
        let stub = mesh();
        let addr = serve_plaintext(stub).await.unwrap();
        let mut client = client_for(addr).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetch_snapshot(&mut client, &cancel).await.unwrap_err();

        assert!(matches!(err, Error::Aborted));
    }
}
