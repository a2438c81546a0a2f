//! End-to-end runs against in-process istiod stand-ins
//!
//! The issuance stub signs CSRs with a test CA over server-only TLS; the ADS
//! stub requires a client certificate chaining to the same CA.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use envoy_types::pb::envoy::config::cluster::v3::cluster::EdsClusterConfig;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use xds_snapshot::config::{ClockSkewPolicy, ServiceEndpoint, SnapshotConfig};
use xds_snapshot::identity::BearerToken;
use xds_snapshot::node::NodeId;
use xds_snapshot::pki::test_util::TestAuthority;
use xds_snapshot::pki::{TrustAnchor, WorkloadIdentity};
use xds_snapshot::proto::istio_certificate_service_server::{
    IstioCertificateService, IstioCertificateServiceServer,
};
use xds_snapshot::proto::{IstioCertificateRequest, IstioCertificateResponse};
use xds_snapshot::session::{take_snapshot, RunInputs};
use xds_snapshot::xds::test_util::StubAds;
use xds_snapshot::xds::{to_any, ResourceType};
use xds_snapshot::{Error, ErrorCategory};

const TOKEN: &str = "eyJhbGciOiJSUzI1NiJ9.test.signature";
const SERVER_NAME: &str = "istiod.istio-system.svc";

// =============================================================================
// Stub issuance service
// =============================================================================

#[derive(Clone, Debug, Default)]
struct IssuanceCall {
    cluster_id: Option<String>,
    validity_secs: i64,
}

#[derive(Clone)]
struct StubIssuer {
    ca: Arc<TestAuthority>,
    not_before_offset: time::Duration,
    calls: Arc<Mutex<Vec<IssuanceCall>>>,
}

impl StubIssuer {
    fn new(ca: TestAuthority) -> Self {
        Self {
            ca: Arc::new(ca),
            not_before_offset: time::Duration::ZERO,
            calls: Arc::default(),
        }
    }

    fn clock_ahead_by(mut self, offset: time::Duration) -> Self {
        self.not_before_offset = offset;
        self
    }

    fn calls(&self) -> Vec<IssuanceCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl IstioCertificateService for StubIssuer {
    async fn create_certificate(
        &self,
        request: Request<IstioCertificateRequest>,
    ) -> Result<Response<IstioCertificateResponse>, Status> {
        let authorization = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if authorization != Some(format!("Bearer {}", TOKEN).as_str()) {
            return Err(Status::unauthenticated("token rejected"));
        }

        let cluster_id = request
            .metadata()
            .get("clusterid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = request.into_inner();
        self.calls.lock().unwrap().push(IssuanceCall {
            cluster_id,
            validity_secs: body.validity_duration,
        });

        let leaf = self
            .ca
            .sign_csr(
                &body.csr,
                self.not_before_offset,
                time::Duration::seconds(body.validity_duration),
            )
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        Ok(Response::new(IstioCertificateResponse {
            cert_chain: vec![leaf],
        }))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    issuer_addr: SocketAddr,
    ads_addr: SocketAddr,
    issuer: StubIssuer,
    ads: StubAds,
}

/// Serve both stubs with serving certificates from `serving_ca`
async fn start(serving_ca: &TestAuthority, issuer: StubIssuer, ads: StubAds) -> Harness {
    // tonic's server TLS uses the process-default provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let serving = serving_ca.server_cert(&[SERVER_NAME]).unwrap();
    let identity = Identity::from_pem(&serving.cert_pem, &serving.key_pem);

    let issuer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let issuer_addr = issuer_listener.local_addr().unwrap();
    let issuer_tls = ServerTlsConfig::new().identity(identity.clone());
    let issuer_service = IstioCertificateServiceServer::new(issuer.clone());
    tokio::spawn(async move {
        Server::builder()
            .tls_config(issuer_tls)
            .unwrap()
            .add_service(issuer_service)
            .serve_with_incoming(TcpListenerStream::new(issuer_listener))
            .await
    });

    let ads_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ads_addr = ads_listener.local_addr().unwrap();
    let ads_tls = ServerTlsConfig::new()
        .identity(identity)
        .client_ca_root(Certificate::from_pem(issuer.ca.cert_pem()));
    let ads_service = ads.clone().into_service();
    tokio::spawn(async move {
        Server::builder()
            .tls_config(ads_tls)
            .unwrap()
            .add_service(ads_service)
            .serve_with_incoming(TcpListenerStream::new(ads_listener))
            .await
    });

    Harness {
        issuer_addr,
        ads_addr,
        issuer,
        ads,
    }
}

impl Harness {
    fn config(&self) -> SnapshotConfig {
        SnapshotConfig {
            discovery: ServiceEndpoint::parse(&format!("https://{}", self.ads_addr)).unwrap(),
            issuance: Some(
                ServiceEndpoint::parse(&format!("https://{}", self.issuer_addr)).unwrap(),
            ),
            server_name: SERVER_NAME.to_string(),
            clock_skew: ClockSkewPolicy {
                max_skew: Duration::from_secs(10),
                poll_interval: Duration::from_millis(100),
            },
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            use_system_roots: false,
            ..Default::default()
        }
    }
}

fn inputs(anchor: &TestAuthority, token: &str) -> RunInputs {
    RunInputs {
        node_id: NodeId::raw("sidecar~192.168.1.1~fake-node.bookinfo~bookinfo.svc.cluster.local")
            .unwrap(),
        identity: WorkloadIdentity::new("cluster.local", "istio-system", "istiod").unwrap(),
        anchor: TrustAnchor::from_der(anchor.cert_der().to_vec()).unwrap(),
        token: BearerToken::new(token).unwrap(),
    }
}

fn svc_a_mesh() -> StubAds {
    let cluster = Cluster {
        name: "svc-a-cluster".to_string(),
        eds_cluster_config: Some(EdsClusterConfig {
            service_name: "svc-a".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    StubAds::new().with_resources(ResourceType::Cluster, vec![to_any(&cluster)])
}

// =============================================================================
// Story: a full run
// =============================================================================

#[tokio::test]
async fn bootstrap_then_snapshot_follows_dependencies() {
    let root = TestAuthority::root("Istio CA").unwrap();
    let harness = start(&root, StubIssuer::new(root.clone()), svc_a_mesh()).await;

    let snapshot = take_snapshot(&harness.config(), inputs(&root, TOKEN), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(snapshot.clusters.names(), vec!["svc-a-cluster"]);
    assert!(snapshot.listeners.resources.is_empty());
    assert!(snapshot.is_complete());

    let requests = harness.ads.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[1].type_url, ResourceType::Endpoint.type_url());
    assert_eq!(requests[1].resource_names, vec!["svc-a"]);
    assert_eq!(requests[3].type_url, ResourceType::Route.type_url());
    assert!(requests[3].resource_names.is_empty());
    assert_eq!(snapshot.routes.requested, Some(Vec::new()));

    assert_eq!(harness.ads.client_cert_presented(), Some(true));

    let calls = harness.issuer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].cluster_id.as_deref(), Some("Kubernetes"));
    assert_eq!(calls[0].validity_secs, 3600);
}

// =============================================================================
// Story: failures are classified
// =============================================================================

#[tokio::test]
async fn rejected_token_is_a_transport_error() {
    let root = TestAuthority::root("Istio CA").unwrap();
    let harness = start(&root, StubIssuer::new(root.clone()), svc_a_mesh()).await;

    let err = take_snapshot(
        &harness.config(),
        inputs(&root, "not-the-token"),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Transport);
    assert!(err.to_string().contains("token rejected"));
    assert!(harness.ads.requests().is_empty());
}

#[tokio::test]
async fn server_outside_the_pinned_anchor_is_untrusted() {
    let serving = TestAuthority::root("Impostor CA").unwrap();
    let pinned = TestAuthority::root("Istio CA").unwrap();
    let harness = start(&serving, StubIssuer::new(serving.clone()), svc_a_mesh()).await;

    let err = take_snapshot(&harness.config(), inputs(&pinned, TOKEN), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Untrusted(_)), "{err}");
    assert!(harness.issuer.calls().is_empty());
}

#[tokio::test]
async fn issued_chain_from_another_ca_is_untrusted() {
    let root = TestAuthority::root("Istio CA").unwrap();
    let rogue = TestAuthority::root("Rogue CA").unwrap();
    let harness = start(&root, StubIssuer::new(rogue), svc_a_mesh()).await;

    let err = take_snapshot(&harness.config(), inputs(&root, TOKEN), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Trust);
    assert_eq!(harness.issuer.calls().len(), 1);
    assert!(harness.ads.requests().is_empty());
}

#[tokio::test]
async fn future_chain_from_another_ca_is_untrusted_not_skewed() {
    let root = TestAuthority::root("Istio CA").unwrap();
    let rogue = TestAuthority::root("Rogue CA").unwrap();
    let issuer = StubIssuer::new(rogue).clock_ahead_by(time::Duration::seconds(30));
    let harness = start(&root, issuer, svc_a_mesh()).await;

    let err = take_snapshot(&harness.config(), inputs(&root, TOKEN), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Trust, "{err}");
    assert!(harness.ads.requests().is_empty());
}

// =============================================================================
// Story: clock skew on the issued certificate
// =============================================================================

#[tokio::test]
async fn small_skew_is_waited_out() {
    let root = TestAuthority::root("Istio CA").unwrap();
    // Certificate times are whole seconds, so +4s starts at least 3s ahead
    let issuer = StubIssuer::new(root.clone()).clock_ahead_by(time::Duration::seconds(4));
    let harness = start(&root, issuer, svc_a_mesh()).await;
    let started = Instant::now();

    let snapshot = take_snapshot(&harness.config(), inputs(&root, TOKEN), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(snapshot.clusters.names(), vec!["svc-a-cluster"]);
}

#[tokio::test]
async fn large_skew_fails_immediately() {
    let root = TestAuthority::root("Istio CA").unwrap();
    let issuer = StubIssuer::new(root.clone()).clock_ahead_by(time::Duration::seconds(30));
    let harness = start(&root, issuer, svc_a_mesh()).await;
    let started = Instant::now();

    let err = take_snapshot(&harness.config(), inputs(&root, TOKEN), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::ClockSkew);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(harness.ads.requests().is_empty());
}

// =============================================================================
// Story: cancellation
// =============================================================================

#[tokio::test]
async fn cancellation_aborts_the_run() {
    let root = TestAuthority::root("Istio CA").unwrap();
    let issuer = StubIssuer::new(root.clone()).clock_ahead_by(time::Duration::seconds(8));
    let harness = start(&root, issuer, svc_a_mesh()).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = take_snapshot(&harness.config(), inputs(&root, TOKEN), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Aborted);
    assert!(harness.ads.requests().is_empty());
}
