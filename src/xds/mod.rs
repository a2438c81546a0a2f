//! Aggregated discovery client
//!
//! One ADS stream, one request and one response per resource type, in the
//! order clusters, endpoints, listeners, routes. Endpoint and route requests
//! are filtered by names derived from the cluster and listener responses.
//!
//! Resources that fail to decode are reported as [`DecodeError`]s next to the
//! ones that did; they never abort the fetch.

pub mod client;
pub mod deps;
pub mod snapshot;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

use thiserror::Error;

pub use client::{node_for, DiscoveryClient};
pub use deps::{
    endpoint_service_names, route_config_names, RouteNames, HTTP_CONNECTION_MANAGER_FILTERS,
};
pub use snapshot::{fetch_snapshot, ResourceSnapshot};
pub use types::{decode_resource, to_any, Resource, ResourceType};

/// A resource in a discovery response that could not be decoded
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{resource_type} resource #{index}: {reason}")]
pub struct DecodeError {
    /// Kind the resource was requested as
    pub resource_type: ResourceType,
    /// Position in the response
    pub index: usize,
    /// What went wrong
    pub reason: String,
}

/// Decoded resources of one kind plus the bookkeeping of the response
#[derive(Clone, Debug)]
pub struct Batch<T> {
    /// Successfully decoded resources, in response order
    pub resources: Vec<T>,
    /// Resources that could not be decoded
    pub errors: Vec<DecodeError>,
    /// Names the request was filtered to; `None` means all
    pub requested: Option<Vec<String>>,
    /// Version reported by the control plane
    pub version_info: String,
    /// Response nonce
    pub nonce: String,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            errors: Vec::new(),
            requested: None,
            version_info: String::new(),
            nonce: String::new(),
        }
    }
}

impl<T: Resource> Batch<T> {
    /// Names of the decoded resources
    pub fn names(&self) -> Vec<&str> {
        self.resources.iter().map(Resource::name).collect()
    }
}
