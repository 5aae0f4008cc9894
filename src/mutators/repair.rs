//! Orphan GC and periodic repair (§4.7): `cleanupOrphanedServices`,
//! `cleanupMirroredResources`, and `repairEndpoints`. Mirrors live in whatever
//! namespace their remote counterpart does, so every list here is cluster-wide
//! over the link's mirror label selector rather than scoped to one namespace.

use k8s_openapi::api::core::v1::EndpointSubset;

use super::objects;
use crate::{cluster::LocalCluster, error::Error, labels, link::Link, metrics::Metrics, naming, resolver};

/// Lists local mirror services for this link and deletes any whose original
/// name no longer exists on the remote cluster.
pub async fn cleanup_orphaned_services(
    local: &dyn LocalCluster,
    remote: &dyn crate::cluster::RemoteCluster,
    link: &Link,
) -> Result<(), Error> {
    let selector = labels::is_mirror_label_selector(&link.target_cluster_name);
    let mirrors = local.list_services_all_namespaces(&selector).await?;

    let mut errors = Vec::new();
    for mirror in mirrors {
        let mirror_namespace = mirror.metadata.namespace.clone().unwrap_or_default();
        let mirror_name = mirror.metadata.name.clone().unwrap_or_default();
        let Some(original) = naming::original_name(&mirror_name, &link.target_cluster_name) else {
            continue;
        };

        match remote.get_service(&mirror_namespace, &original).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(err) = local.delete_service(&mirror_namespace, &mirror_name).await {
                    errors.push(eyre::eyre!("deleting orphaned service {mirror_name}: {err}"));
                }
            }
            Err(err) => errors.push(eyre::eyre!("checking remote for {mirror_name}: {err}")),
        }
    }

    crate::error::aggregate(errors)
}

/// Deletes every local service and endpoints object carrying this link's
/// mirror labels (§4.7, `ClusterUnregistered`).
pub async fn cleanup_mirrored_resources(local: &dyn LocalCluster, link: &Link) -> Result<(), Error> {
    let selector = labels::is_mirror_label_selector(&link.target_cluster_name);

    let mut errors = Vec::new();

    match local.list_services_all_namespaces(&selector).await {
        Ok(services) => {
            for svc in services {
                let namespace = svc.metadata.namespace.clone().unwrap_or_default();
                let name = svc.metadata.name.clone().unwrap_or_default();
                if let Err(err) = local.delete_service(&namespace, &name).await {
                    errors.push(eyre::eyre!("deleting mirrored service {name}: {err}"));
                }
            }
        }
        Err(err) => errors.push(eyre::eyre!("listing mirrored services: {err}")),
    }

    match local.list_endpoints_all_namespaces(&selector).await {
        Ok(endpoints) => {
            for ep in endpoints {
                let namespace = ep.metadata.namespace.clone().unwrap_or_default();
                let name = ep.metadata.name.clone().unwrap_or_default();
                if let Err(err) = local.delete_endpoints(&namespace, &name).await {
                    errors.push(eyre::eyre!("deleting mirrored endpoints {name}: {err}"));
                }
            }
        }
        Err(err) => errors.push(eyre::eyre!("listing mirrored endpoints: {err}")),
    }

    crate::error::aggregate(errors)
}

/// Re-derives the gateway-probe endpoints and every non-headless mirror's
/// endpoints from scratch, on the repair tick (§4.7). A per-service failure is
/// logged and does not abort the sweep.
pub async fn repair_endpoints(
    local: &dyn LocalCluster,
    resolver: &dyn resolver::Resolve,
    metrics: &Metrics,
    controller_namespace: &str,
    link: &Link,
) -> Result<(), Error> {
    let gateway_ips = resolver::resolve_gateway_addresses(resolver, &link.gateway_addresses()).await?;

    metrics.record_repair(&link.target_cluster_name);

    let probe_endpoints = objects::build_gateway_probe_endpoints(
        controller_namespace,
        &link.target_cluster_name,
        &gateway_ips,
        link.probe_port,
    );
    let probe_name = probe_endpoints.metadata.name.clone().unwrap_or_default();
    match local.get_endpoints(controller_namespace, &probe_name).await {
        Ok(Some(_)) => {
            if let Err(err) = local.update_endpoints(probe_endpoints).await {
                tracing::warn!(%err, "updating gateway-probe endpoints failed");
            }
        }
        Ok(None) => {
            if let Err(err) = local.create_endpoints(probe_endpoints).await {
                tracing::warn!(%err, "creating gateway-probe endpoints failed");
            }
        }
        Err(err) => tracing::warn!(%err, "fetching gateway-probe endpoints failed"),
    }

    let selector = labels::is_mirror_label_selector(&link.target_cluster_name);
    let mirrors = local.list_services_all_namespaces(&selector).await?;

    for mirror in mirrors {
        if objects::is_headless(&mirror) {
            continue;
        }

        let mirror_namespace = mirror.metadata.namespace.clone().unwrap_or_default();
        let mirror_name = mirror.metadata.name.clone().unwrap_or_default();

        let existing = match local.get_endpoints(&mirror_namespace, &mirror_name).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                tracing::warn!(name = %mirror_name, "repair: mirror service has no endpoints object");
                continue;
            }
            Err(err) => {
                tracing::warn!(%err, name = %mirror_name, "repair: fetching mirror endpoints failed");
                continue;
            }
        };

        let mirror_ports = mirror
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();

        let mut rebuilt = existing;
        rebuilt.subsets = Some(vec![EndpointSubset {
            addresses: Some(objects::gateway_endpoint_addresses(&gateway_ips)),
            not_ready_addresses: None,
            ports: Some(objects::gateway_endpoint_ports(&mirror_ports, link.gateway_port)),
        }]);
        if let Some(identity) = link.gateway_identity() {
            rebuilt
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(
                    labels::REMOTE_GATEWAY_IDENTITY_ANNOTATION.to_string(),
                    identity.to_string(),
                );
        }

        if let Err(err) = local.update_service(mirror).await {
            tracing::warn!(%err, name = %mirror_name, "repair: updating mirror service failed");
            continue;
        }
        if let Err(err) = local.update_endpoints(rebuilt).await {
            tracing::warn!(%err, name = %mirror_name, "repair: updating mirror endpoints failed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use eyre::Report;
    use k8s_openapi::{
        api::core::v1::{Service, ServicePort, ServiceSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;
    use crate::cluster::fake::FakeCluster;

    struct FakeResolver(HashMap<String, Vec<std::net::IpAddr>>);

    #[async_trait]
    impl resolver::Resolve for FakeResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<std::net::IpAddr>, Report> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| eyre::eyre!("no such host: {host}"))
        }
    }

    fn link() -> Link {
        Link {
            target_cluster_name: "west".to_string(),
            target_cluster_domain: "cluster.local".to_string(),
            gateway_address: "10.0.0.1".to_string(),
            gateway_port: 4143,
            gateway_identity: String::new(),
            probe_port: 80,
            selector: "mirror.linkerd.io/exported=true".to_string(),
        }
    }

    fn mirror_service(namespace: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels::mirror_labels("west")),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.1.1.1".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn orphaned_service_is_deleted_when_remote_is_gone() {
        let local = FakeCluster::new();
        local.seed_service(mirror_service("app", "foo-west"));

        cleanup_orphaned_services(&local, &local, &link()).await.unwrap();

        assert!(local.get_service("app", "foo-west").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphaned_service_survives_when_remote_still_exists() {
        let local = FakeCluster::new();
        local.seed_service(mirror_service("app", "foo-west"));
        local.seed_service(Service {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                namespace: Some("app".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        cleanup_orphaned_services(&local, &local, &link()).await.unwrap();

        assert!(local.get_service("app", "foo-west").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cluster_unregistered_deletes_everything_mirrored() {
        let local = FakeCluster::new();
        local.seed_service(mirror_service("app", "foo-west"));
        local.seed_endpoints(k8s_openapi::api::core::v1::Endpoints {
            metadata: ObjectMeta {
                name: Some("foo-west".to_string()),
                namespace: Some("app".to_string()),
                labels: Some(labels::mirror_labels("west")),
                ..Default::default()
            },
            subsets: None,
        });

        cleanup_mirrored_resources(&local, &link()).await.unwrap();

        assert!(local.get_service("app", "foo-west").await.unwrap().is_none());
        assert!(local.get_endpoints("app", "foo-west").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repair_rebuilds_gateway_probe_and_mirror_endpoints() {
        let local = FakeCluster::new();
        local.seed_service(mirror_service("app", "foo-west"));
        local.seed_endpoints(k8s_openapi::api::core::v1::Endpoints {
            metadata: ObjectMeta {
                name: Some("foo-west".to_string()),
                namespace: Some("app".to_string()),
                ..Default::default()
            },
            subsets: None,
        });

        let resolver = FakeResolver(HashMap::from([(
            "10.0.0.1".to_string(),
            vec!["10.0.0.1".parse().unwrap()],
        )]));
        let metrics = Metrics::new().unwrap();

        repair_endpoints(&local, &resolver, &metrics, "linkerd-multicluster", &link())
            .await
            .unwrap();

        let probe = local
            .get_endpoints("linkerd-multicluster", "probe-gateway-west")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            probe.subsets.as_ref().unwrap()[0].addresses.as_ref().unwrap()[0].ip,
            "10.0.0.1"
        );

        let endpoints = local.get_endpoints("app", "foo-west").await.unwrap().unwrap();
        let subset = &endpoints.subsets.as_ref().unwrap()[0];
        assert_eq!(subset.ports.as_ref().unwrap()[0].port, 4143);
    }

    #[tokio::test]
    async fn repair_skips_headless_mirrors() {
        let local = FakeCluster::new();
        let mut headless = mirror_service("app", "db-west");
        headless.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        local.seed_service(headless);

        let resolver = FakeResolver(HashMap::from([(
            "10.0.0.1".to_string(),
            vec!["10.0.0.1".parse().unwrap()],
        )]));
        let metrics = Metrics::new().unwrap();

        repair_endpoints(&local, &resolver, &metrics, "linkerd-multicluster", &link())
            .await
            .unwrap();

        assert!(local.get_endpoints("app", "db-west").await.unwrap().is_none());
    }
}
