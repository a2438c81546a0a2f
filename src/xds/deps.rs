//! Cross-type name dependencies
//!
//! Endpoints are requested by the service names clusters point at, routes by
//! the route configuration names listeners delegate to. Both derivations
//! return a sorted, de-duplicated list so the result does not depend on the
//! order the control plane returned resources in.

use std::collections::BTreeSet;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, Listener};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpConnectionManager;
use prost::Message;
use tracing::warn;

use super::{DecodeError, ResourceType};

/// Filter names the HTTP connection manager has been registered under
pub const HTTP_CONNECTION_MANAGER_FILTERS: [&str; 2] = [
    "envoy.filters.network.http_connection_manager",
    "envoy.http_connection_manager",
];

const HTTP_CONNECTION_MANAGER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

/// Distinct EDS service names referenced by `clusters`
pub fn endpoint_service_names(clusters: &[Cluster]) -> Vec<String> {
    clusters
        .iter()
        .filter_map(|cluster| cluster.eds_cluster_config.as_ref())
        .map(|eds| eds.service_name.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Route configuration names derived from listeners
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteNames {
    /// Distinct RDS names, sorted
    pub names: Vec<String>,
    /// Connection managers whose config could not be read; `index` is the
    /// listener's position in the slice that was inspected
    pub errors: Vec<DecodeError>,
}

/// Distinct RDS route configuration names referenced by `listeners`
///
/// Every filter chain is inspected, including the default one. Managers
/// carrying an inline route table contribute nothing. A manager whose config
/// is missing or cannot be decoded is reported against its listener.
pub fn route_config_names(listeners: &[Listener]) -> RouteNames {
    let mut names = BTreeSet::new();
    let mut errors = Vec::new();

    for (index, listener) in listeners.iter().enumerate() {
        let chains = listener
            .filter_chains
            .iter()
            .chain(listener.default_filter_chain.as_ref());
        for chain in chains {
            for filter in &chain.filters {
                if !HTTP_CONNECTION_MANAGER_FILTERS.contains(&filter.name.as_str()) {
                    continue;
                }
                match rds_name(filter) {
                    Ok(Some(name)) => {
                        names.insert(name);
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(
                            listener = %listener.name,
                            filter = %filter.name,
                            %reason,
                            "Unreadable HTTP connection manager config"
                        );
                        errors.push(DecodeError {
                            resource_type: ResourceType::Listener,
                            index,
                            reason: format!("listener '{}': {}", listener.name, reason),
                        });
                    }
                }
            }
        }
    }

    RouteNames {
        names: names.into_iter().collect(),
        errors,
    }
}

/// The RDS name a connection manager filter delegates to, if any
fn rds_name(filter: &Filter) -> Result<Option<String>, String> {
    let any = match &filter.config_type {
        Some(filter::ConfigType::TypedConfig(any)) => any,
        Some(filter::ConfigType::ConfigDiscovery(_)) => {
            return Err(format!(
                "{} config is served by extension config discovery",
                filter.name
            ))
        }
        None => return Err(format!("{} has no typed config", filter.name)),
    };

    if any.type_url != HTTP_CONNECTION_MANAGER_TYPE_URL {
        return Err(format!(
            "{} carries unexpected config type {}",
            filter.name, any.type_url
        ));
    }

    let manager = HttpConnectionManager::decode(any.value.as_slice())
        .map_err(|e| format!("{} config does not decode: {}", filter.name, e))?;

    Ok(match manager.route_specifier {
        Some(RouteSpecifier::Rds(rds)) if !rds.route_config_name.is_empty() => {
            Some(rds.route_config_name)
        }
        _ => None,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for clusters and listeners shaped like istiod's output

    use envoy_types::pb::envoy::config::cluster::v3::cluster::{
        ClusterDiscoveryType, DiscoveryType, EdsClusterConfig,
    };
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
    use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
    use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;
    use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
        HttpConnectionManager, Rds,
    };
    use envoy_types::pb::google::protobuf::Any;
    use prost::Message;

    use super::HTTP_CONNECTION_MANAGER_TYPE_URL;

    pub fn eds_cluster(name: &str, service_name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            eds_cluster_config: Some(EdsClusterConfig {
                service_name: service_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn static_cluster(name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(
                DiscoveryType::Static as i32,
            )),
            ..Default::default()
        }
    }

    fn manager_filter(filter_name: &str, specifier: RouteSpecifier) -> Filter {
        let manager = HttpConnectionManager {
            stat_prefix: "outbound".to_string(),
            route_specifier: Some(specifier),
            ..Default::default()
        };
        Filter {
            name: filter_name.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(Any {
                type_url: HTTP_CONNECTION_MANAGER_TYPE_URL.to_string(),
                value: manager.encode_to_vec(),
            })),
        }
    }

    fn listener_with(name: &str, filter: Filter) -> Listener {
        Listener {
            name: name.to_string(),
            filter_chains: vec![FilterChain {
                filters: vec![filter],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn rds_listener(name: &str, filter_name: &str, route: &str) -> Listener {
        listener_with(
            name,
            manager_filter(
                filter_name,
                RouteSpecifier::Rds(Rds {
                    route_config_name: route.to_string(),
                    ..Default::default()
                }),
            ),
        )
    }

    pub fn inline_route_listener(name: &str) -> Listener {
        listener_with(
            name,
            manager_filter(
                "envoy.filters.network.http_connection_manager",
                RouteSpecifier::RouteConfig(RouteConfiguration {
                    name: "inline".to_string(),
                    ..Default::default()
                }),
            ),
        )
    }

    pub fn tcp_proxy_listener(name: &str) -> Listener {
        listener_with(
            name,
            Filter {
                name: "envoy.filters.network.tcp_proxy".to_string(),
                config_type: None,
            },
        )
    }

    pub fn configless_manager_listener(name: &str) -> Listener {
        listener_with(
            name,
            Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: None,
            },
        )
    }

    pub fn corrupt_manager_listener(name: &str) -> Listener {
        listener_with(
            name,
            Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(Any {
                    type_url: HTTP_CONNECTION_MANAGER_TYPE_URL.to_string(),
                    value: vec![0xff, 0xff, 0xff],
                })),
            },
        )
    }
}
