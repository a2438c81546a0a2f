//! Console rendering of a snapshot

use std::io::{self, Write};

use clap::ValueEnum;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::Address;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;

use crate::xds::{Batch, ResourceSnapshot};

/// How to print a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per resource
    #[default]
    Summary,
    /// Every field of every resource
    Debug,
}

/// Write `snapshot` to `out`
pub fn render(snapshot: &ResourceSnapshot, format: OutputFormat, out: &mut impl Write) -> io::Result<()> {
    match format {
        OutputFormat::Summary => {
            section(out, "Clusters", &snapshot.clusters, cluster_line)?;
            section(out, "Endpoints", &snapshot.endpoints, endpoint_line)?;
            section(out, "Listeners", &snapshot.listeners, listener_line)?;
            section(out, "Routes", &snapshot.routes, route_line)?;
        }
        OutputFormat::Debug => {
            debug_section(out, "Clusters", &snapshot.clusters)?;
            debug_section(out, "Endpoints", &snapshot.endpoints)?;
            debug_section(out, "Listeners", &snapshot.listeners)?;
            debug_section(out, "Routes", &snapshot.routes)?;
        }
    }

    let errors: Vec<_> = snapshot.decode_errors().collect();
    if !errors.is_empty() {
        heading(out, "Decode errors")?;
        for error in errors {
            writeln!(out, "{}", error)?;
        }
    }
    Ok(())
}

fn heading(out: &mut impl Write, title: &str) -> io::Result<()> {
    writeln!(out, "======= {} =======", title)
}

fn batch_header<T>(out: &mut impl Write, title: &str, batch: &Batch<T>) -> io::Result<()> {
    heading(out, title)?;
    match &batch.requested {
        Some(names) => writeln!(out, "# requested: [{}]", names.join(", "))?,
        None => writeln!(out, "# requested: all")?,
    }
    writeln!(
        out,
        "# version: {}  count: {}",
        display_or_dash(&batch.version_info),
        batch.resources.len()
    )
}

fn section<T>(
    out: &mut impl Write,
    title: &str,
    batch: &Batch<T>,
    line: fn(&T) -> String,
) -> io::Result<()> {
    batch_header(out, title, batch)?;
    for resource in &batch.resources {
        writeln!(out, "{}", line(resource))?;
    }
    writeln!(out)
}

fn debug_section<T: std::fmt::Debug>(
    out: &mut impl Write,
    title: &str,
    batch: &Batch<T>,
) -> io::Result<()> {
    batch_header(out, title, batch)?;
    for resource in &batch.resources {
        writeln!(out, "{:#?}", resource)?;
    }
    writeln!(out)
}

fn cluster_line(cluster: &Cluster) -> String {
    let kind = match &cluster.cluster_discovery_type {
        Some(ClusterDiscoveryType::Type(t)) => DiscoveryType::try_from(*t)
            .map(|t| t.as_str_name().to_string())
            .unwrap_or_else(|_| format!("UNKNOWN({})", t)),
        Some(ClusterDiscoveryType::ClusterType(custom)) => custom.name.clone(),
        None => "-".to_string(),
    };

    match cluster.eds_cluster_config.as_ref().map(|e| e.service_name.as_str()) {
        Some(service) if !service.is_empty() => {
            format!("{}  type={}  eds_service={}", cluster.name, kind, service)
        }
        _ => format!("{}  type={}", cluster.name, kind),
    }
}

fn endpoint_line(assignment: &ClusterLoadAssignment) -> String {
    let endpoints: usize = assignment
        .endpoints
        .iter()
        .map(|locality| locality.lb_endpoints.len())
        .sum();
    format!(
        "{}  localities={}  endpoints={}",
        assignment.cluster_name,
        assignment.endpoints.len(),
        endpoints
    )
}

fn listener_line(listener: &Listener) -> String {
    format!(
        "{}  address={}  filter_chains={}",
        listener.name,
        listener
            .address
            .as_ref()
            .map(socket_address)
            .unwrap_or_else(|| "-".to_string()),
        listener.filter_chains.len()
    )
}

fn route_line(route: &RouteConfiguration) -> String {
    let domains: Vec<&str> = route
        .virtual_hosts
        .iter()
        .flat_map(|vh| vh.domains.iter().map(String::as_str))
        .collect();
    format!(
        "{}  virtual_hosts={}  domains=[{}]",
        route.name,
        route.virtual_hosts.len(),
        domains.join(", ")
    )
}

fn socket_address(address: &Address) -> String {
    match &address.address {
        Some(AddressKind::SocketAddress(socket)) => match socket.port_specifier {
            Some(PortSpecifier::PortValue(port)) => format!("{}:{}", socket.address, port),
            _ => socket.address.clone(),
        },
        Some(AddressKind::Pipe(pipe)) => format!("unix:{}", pipe.path),
        _ => "-".to_string(),
    }
}

fn display_or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::deps::fixtures::*;
    use crate::xds::{DecodeError, ResourceType};
    use envoy_types::pb::envoy::config::core::v3::SocketAddress;
    use envoy_types::pb::envoy::config::route::v3::VirtualHost;

    fn snapshot() -> ResourceSnapshot {
        let mut listener = rds_listener(
            "0.0.0.0_9080",
            "envoy.filters.network.http_connection_manager",
            "9080",
        );
        listener.address = Some(Address {
            address: Some(AddressKind::SocketAddress(SocketAddress {
                address: "0.0.0.0".to_string(),
                port_specifier: Some(PortSpecifier::PortValue(9080)),
                ..Default::default()
            })),
        });

        ResourceSnapshot {
            clusters: Batch {
                resources: vec![eds_cluster("outbound|9080||reviews", "reviews")],
                version_info: "v1".to_string(),
                ..Default::default()
            },
            endpoints: Batch {
                requested: Some(vec!["reviews".to_string()]),
                ..Default::default()
            },
            listeners: Batch {
                resources: vec![listener],
                errors: vec![DecodeError {
                    resource_type: ResourceType::Listener,
                    index: 1,
                    reason: "invalid wire type".to_string(),
                }],
                ..Default::default()
            },
            routes: Batch {
                resources: vec![RouteConfiguration {
                    name: "9080".to_string(),
                    virtual_hosts: vec![VirtualHost {
                        name: "reviews.default.svc.cluster.local:9080".to_string(),
                        domains: vec!["reviews".to_string(), "reviews.default".to_string()],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                requested: Some(vec!["9080".to_string()]),
                ..Default::default()
            },
        }
    }

    fn rendered(format: OutputFormat) -> String {
        let mut out = Vec::new();
        render(&snapshot(), format, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn summary_has_a_section_per_kind() {
        let text = rendered(OutputFormat::Summary);

        for title in ["Clusters", "Endpoints", "Listeners", "Routes", "Decode errors"] {
            assert!(text.contains(&format!("======= {} =======", title)), "{title}");
        }
    }

    #[test]
    fn summary_lines_carry_key_facts() {
        let text = rendered(OutputFormat::Summary);

        assert!(text.contains("outbound|9080||reviews  type=EDS  eds_service=reviews"));
        assert!(text.contains("0.0.0.0_9080  address=0.0.0.0:9080  filter_chains=1"));
        assert!(text.contains("domains=[reviews, reviews.default]"));
        assert!(text.contains("# requested: [reviews]"));
        assert!(text.contains("# requested: all"));
        assert!(text.contains("listener resource #1: invalid wire type"));
    }

    #[test]
    fn debug_dumps_fields() {
        let text = rendered(OutputFormat::Debug);

        assert!(text.contains("eds_cluster_config"));
        assert!(text.contains("virtual_hosts"));
    }
}
