//! Resource type table and typed decoding

use std::fmt;
use std::str::FromStr;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::TypedExtensionConfig;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use envoy_types::pb::envoy::service::runtime::v3::Runtime;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use super::DecodeError;
use crate::error::Error;

/// Discovery resource kinds handled by the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    /// Endpoint assignments (EDS)
    Endpoint,
    /// Upstream clusters (CDS)
    Cluster,
    /// Route configurations (RDS)
    Route,
    /// Listeners (LDS)
    Listener,
    /// TLS secrets (SDS)
    Secret,
    /// Extension configurations (ECDS)
    ExtensionConfig,
    /// Runtime layers (RTDS)
    Runtime,
}

impl ResourceType {
    /// Every handled kind, in wire-table order
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Endpoint,
        ResourceType::Cluster,
        ResourceType::Route,
        ResourceType::Listener,
        ResourceType::Secret,
        ResourceType::ExtensionConfig,
        ResourceType::Runtime,
    ];

    /// Type URL used on the wire
    pub const fn type_url(self) -> &'static str {
        match self {
            ResourceType::Endpoint => {
                "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            }
            ResourceType::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            ResourceType::Route => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            ResourceType::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            ResourceType::Secret => {
                "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
            }
            ResourceType::ExtensionConfig => {
                "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig"
            }
            ResourceType::Runtime => "type.googleapis.com/envoy.service.runtime.v3.Runtime",
        }
    }

    /// Short lowercase name for logs and the CLI
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceType::Endpoint => "endpoint",
            ResourceType::Cluster => "cluster",
            ResourceType::Route => "route",
            ResourceType::Listener => "listener",
            ResourceType::Secret => "secret",
            ResourceType::ExtensionConfig => "extension-config",
            ResourceType::Runtime => "runtime",
        }
    }

    /// Look a kind up by its type URL
    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_url() == type_url)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::configuration(format!("unknown resource type '{}'", s)))
    }
}

/// A resource schema known to the discovery client
pub trait Resource: Message + Default + Sized {
    /// Kind this schema is delivered as
    const TYPE: ResourceType;

    /// Resource name as the control plane knows it
    fn name(&self) -> &str;
}

macro_rules! named_resource {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl Resource for $ty {
            const TYPE: ResourceType = $kind;

            fn name(&self) -> &str {
                &self.$field
            }
        }
    };
}

named_resource!(Cluster, ResourceType::Cluster, name);
named_resource!(ClusterLoadAssignment, ResourceType::Endpoint, cluster_name);
named_resource!(Listener, ResourceType::Listener, name);
named_resource!(RouteConfiguration, ResourceType::Route, name);
named_resource!(Secret, ResourceType::Secret, name);
named_resource!(TypedExtensionConfig, ResourceType::ExtensionConfig, name);
named_resource!(Runtime, ResourceType::Runtime, name);

/// Decode one type-erased resource into `T`
///
/// `index` is the resource's position in its response, used to identify
/// resources that could not be decoded far enough to learn their name.
pub fn decode_resource<T: Resource>(index: usize, any: &Any) -> Result<T, DecodeError> {
    if any.type_url != T::TYPE.type_url() {
        return Err(DecodeError {
            resource_type: T::TYPE,
            index,
            reason: format!("unexpected payload type '{}'", any.type_url),
        });
    }

    T::decode(any.value.as_slice()).map_err(|e| DecodeError {
        resource_type: T::TYPE,
        index,
        reason: e.to_string(),
    })
}

/// Wrap `message` in a type-erased envelope
pub fn to_any<T: Resource>(message: &T) -> Any {
    Any {
        type_url: T::TYPE.type_url().to_string(),
        value: message.encode_to_vec(),
    }
}
