//! Pure builders for every kind of object this core manages (§3). Nothing here
//! touches the API -- mutators in sibling modules decide when to create vs.
//! update and perform the actual calls.

use std::{collections::BTreeMap, net::IpAddr};

use k8s_openapi::{
    api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use crate::{labels, naming};

/// Projects remote service ports onto a mirror: keep `{name, protocol, port,
/// targetPort}`, discard `nodePort` (§3 Mirror Service).
pub fn remap_service_ports(remote_ports: &[ServicePort]) -> Vec<ServicePort> {
    remote_ports
        .iter()
        .map(|p| ServicePort {
            name: p.name.clone(),
            protocol: p.protocol.clone(),
            port: p.port,
            target_port: p.target_port.clone(),
            app_protocol: p.app_protocol.clone(),
            node_port: None,
        })
        .collect()
}

/// Reuses a mirror's port *names* and *protocols* but overwrites `port` with the
/// gateway port (P3: "the port names equal the mirror service port names
/// one-for-one").
pub fn gateway_endpoint_ports(mirror_ports: &[ServicePort], gateway_port: u16) -> Vec<EndpointPort> {
    mirror_ports
        .iter()
        .map(|p| EndpointPort {
            name: p.name.clone(),
            protocol: p.protocol.clone(),
            app_protocol: p.app_protocol.clone(),
            port: i32::from(gateway_port),
        })
        .collect()
}

pub fn gateway_endpoint_addresses(ips: &[IpAddr]) -> Vec<EndpointAddress> {
    ips.iter()
        .map(|ip| EndpointAddress {
            ip: ip.to_string(),
            hostname: None,
            node_name: None,
            target_ref: None,
        })
        .collect()
}

pub fn is_headless(remote: &Service) -> bool {
    remote
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        == Some("None")
}

/// Every named (non-empty hostname) address across all subsets, in subset
/// order, deduplicated.
pub fn named_hostnames(endpoints: &Endpoints) -> Vec<String> {
    use itertools::Itertools;

    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|addr| addr.hostname.clone())
        .unique()
        .collect()
}

/// A remote is a *valid* headless service only when it's headless *and* its
/// endpoints carry at least one named address (§4.4 create path).
pub fn is_valid_headless_service(remote: &Service, remote_endpoints: Option<&Endpoints>) -> bool {
    is_headless(remote)
        && remote_endpoints
            .map(|ep| !named_hostnames(ep).is_empty())
            .unwrap_or(false)
}

pub fn has_ports(remote: &Service) -> bool {
    remote
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| !ports.is_empty())
}

pub struct MirrorServiceInput<'a> {
    pub remote: &'a Service,
    pub target_cluster_name: &'a str,
    pub target_cluster_domain: &'a str,
    pub headless: bool,
}

pub fn build_mirror_service(input: MirrorServiceInput<'_>) -> Service {
    let remote_name = input.remote.metadata.name.clone().unwrap_or_default();
    let remote_namespace = input.remote.metadata.namespace.clone().unwrap_or_default();

    let mut annotations = BTreeMap::from([
        (
            labels::REMOTE_RESOURCE_VERSION_ANNOTATION.to_string(),
            input
                .remote
                .metadata
                .resource_version
                .clone()
                .unwrap_or_default(),
        ),
        (
            labels::REMOTE_SVC_FQ_NAME_ANNOTATION.to_string(),
            naming::service_fq_name(&remote_name, &remote_namespace, input.target_cluster_domain),
        ),
    ]);
    if let Some(opaque) = labels::opaque_ports_passthrough(input.remote) {
        annotations.insert(labels::OPAQUE_PORTS_ANNOTATION.to_string(), opaque);
    }

    let ports = input
        .remote
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| remap_service_ports(ports));

    Service {
        metadata: ObjectMeta {
            name: Some(naming::mirror_name(&remote_name, input.target_cluster_name)),
            namespace: Some(remote_namespace),
            labels: Some(labels::mirror_labels(input.target_cluster_name)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: input.headless.then(|| "None".to_string()),
            ports,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Non-headless mirror endpoints: one subset, gateway addresses, remapped
/// ports (I3).
pub fn build_mirror_endpoints(
    mirror: &Service,
    gateway_ips: &[IpAddr],
    gateway_port: u16,
    gateway_identity: Option<&str>,
) -> Endpoints {
    let mirror_ports = mirror
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();

    Endpoints {
        metadata: ObjectMeta {
            name: mirror.metadata.name.clone(),
            namespace: mirror.metadata.namespace.clone(),
            labels: mirror.metadata.labels.clone(),
            annotations: gateway_identity_annotation(gateway_identity),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(gateway_endpoint_addresses(gateway_ips)),
            not_ready_addresses: None,
            ports: Some(gateway_endpoint_ports(&mirror_ports, gateway_port)),
        }]),
    }
}

pub fn build_gateway_probe_endpoints(
    controller_namespace: &str,
    target_cluster_name: &str,
    gateway_ips: &[IpAddr],
    probe_port: u16,
) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(naming::gateway_probe_name(target_cluster_name)),
            namespace: Some(controller_namespace.to_string()),
            labels: Some(labels::mirror_labels(target_cluster_name)),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(gateway_endpoint_addresses(gateway_ips)),
            not_ready_addresses: None,
            ports: Some(vec![EndpointPort {
                name: Some("mc-probe".to_string()),
                port: i32::from(probe_port),
                protocol: Some("TCP".to_string()),
                app_protocol: None,
            }]),
        }]),
    }
}

pub struct EndpointMirrorServiceInput<'a> {
    pub hostname: &'a str,
    pub remote: &'a Service,
    pub remote_endpoints_resource_version: &'a str,
    pub target_cluster_name: &'a str,
    pub target_cluster_domain: &'a str,
    pub headless_mirror_name: &'a str,
}

pub fn build_endpoint_mirror_service(input: EndpointMirrorServiceInput<'_>) -> Service {
    let remote_name = input.remote.metadata.name.clone().unwrap_or_default();
    let remote_namespace = input.remote.metadata.namespace.clone().unwrap_or_default();

    let ports = input
        .remote
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| remap_service_ports(ports));

    Service {
        metadata: ObjectMeta {
            name: Some(naming::endpoint_mirror_name(
                input.hostname,
                input.target_cluster_name,
            )),
            namespace: Some(remote_namespace.clone()),
            labels: Some(labels::endpoint_mirror_labels(
                input.target_cluster_name,
                input.headless_mirror_name,
            )),
            annotations: Some(BTreeMap::from([
                (
                    labels::REMOTE_RESOURCE_VERSION_ANNOTATION.to_string(),
                    input.remote_endpoints_resource_version.to_string(),
                ),
                (
                    labels::REMOTE_SVC_FQ_NAME_ANNOTATION.to_string(),
                    naming::endpoint_mirror_fq_name(
                        input.hostname,
                        &remote_name,
                        &remote_namespace,
                        input.target_cluster_domain,
                    ),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: None,
            ports,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_endpoint_mirror_endpoints(
    endpoint_mirror: &Service,
    gateway_ips: &[IpAddr],
    gateway_port: u16,
    gateway_identity: Option<&str>,
) -> Endpoints {
    let ports = endpoint_mirror
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();

    Endpoints {
        metadata: ObjectMeta {
            name: endpoint_mirror.metadata.name.clone(),
            namespace: endpoint_mirror.metadata.namespace.clone(),
            labels: endpoint_mirror.metadata.labels.clone(),
            annotations: gateway_identity_annotation(gateway_identity),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(gateway_endpoint_addresses(gateway_ips)),
            not_ready_addresses: None,
            ports: Some(gateway_endpoint_ports(&ports, gateway_port)),
        }]),
    }
}

/// Which field the headless-mirror-endpoints builder stamps as the address's
/// hostname. The create and update paths genuinely diverge in the source (§9
/// Open Question): creation uses the named address's `targetRef.name` (falling
/// back to the hostname when no target ref is present), update matches on the
/// hostname it already used to key the endpoint-mirror lookup. This is
/// preserved deliberately rather than unified.
#[derive(Clone, Copy)]
pub enum HostnameField {
    FromHostname,
    FromTargetRefName,
}

/// Builds headless-mirror-endpoints subsets: each remote subset's ports are
/// kept as-is, its addresses replaced by `{hostname, ip}` pairs resolved
/// through `hostname_ips`. A subset with no resolvable named address is
/// dropped entirely (§4.5).
pub fn build_headless_subsets(
    remote_endpoints: &Endpoints,
    hostname_ips: &BTreeMap<String, String>,
    hostname_field: HostnameField,
) -> Vec<EndpointSubset> {
    remote_endpoints
        .subsets
        .iter()
        .flatten()
        .filter_map(|subset| {
            let addresses: Vec<EndpointAddress> = subset
                .addresses
                .iter()
                .flatten()
                .filter_map(|addr| {
                    let hostname = addr.hostname.as_ref()?;
                    let ip = hostname_ips.get(hostname)?;
                    let written_hostname = match hostname_field {
                        HostnameField::FromHostname => hostname.clone(),
                        HostnameField::FromTargetRefName => addr
                            .target_ref
                            .as_ref()
                            .and_then(|r| r.name.clone())
                            .unwrap_or_else(|| hostname.clone()),
                    };
                    Some(EndpointAddress {
                        hostname: Some(written_hostname),
                        ip: ip.clone(),
                        node_name: None,
                        target_ref: None,
                    })
                })
                .collect();

            if addresses.is_empty() {
                None
            } else {
                Some(EndpointSubset {
                    addresses: Some(addresses),
                    not_ready_addresses: None,
                    ports: subset.ports.clone(),
                })
            }
        })
        .collect()
}

fn gateway_identity_annotation(identity: Option<&str>) -> Option<BTreeMap<String, String>> {
    identity.map(|identity| {
        BTreeMap::from([(
            labels::REMOTE_GATEWAY_IDENTITY_ANNOTATION.to_string(),
            identity.to_string(),
        )])
    })
}
