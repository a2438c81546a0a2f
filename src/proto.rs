//! gRPC protocol definitions for the Istio certificate-issuance service
//!
//! istiod serves `istio.v1.auth.IstioCertificateService` on its discovery port.
//! A workload submits a PEM-encoded CSR plus a requested validity and receives
//! the signed chain as PEM strings, leaf first. Authentication travels as call
//! metadata (`authorization: Bearer <token>`, `clusterid: <cluster>`), never in
//! the message body.
//!
//! The messages are declared here; the client and server stubs are generated
//! by `build.rs`.
//!
//! # Example
//!
//! ```ignore
//! use xds_snapshot::proto::istio_certificate_service_client::IstioCertificateServiceClient;
//!
//! let mut client = IstioCertificateServiceClient::new(channel);
//! let response = client.create_certificate(request).await?;
//! let chain = response.into_inner().cert_chain;
//! ```

#![allow(missing_docs)] // Generated code doesn't have docs

/// Certificate request sent to the issuance service
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IstioCertificateRequest {
    /// PEM-encoded certificate signing request
    #[prost(string, tag = "1")]
    pub csr: ::prost::alloc::string::String,
    /// Requested certificate lifetime in seconds
    #[prost(int64, tag = "3")]
    pub validity_duration: i64,
    /// Optional request metadata (impersonation hints, unused here)
    #[prost(message, optional, tag = "4")]
    pub metadata: ::core::option::Option<::prost_types::Struct>,
}

/// Signed certificate chain returned by the issuance service
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IstioCertificateResponse {
    /// PEM-encoded certificates, leaf first
    #[prost(string, repeated, tag = "1")]
    pub cert_chain: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

include!(concat!(
    env!("OUT_DIR"),
    "/istio.v1.auth.IstioCertificateService.rs"
));
