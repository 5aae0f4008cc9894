//! `createOrUpdateService` and its three handlers (§4.4).

use k8s_openapi::api::core::v1::{Endpoints, EndpointSubset, Service};

use super::{objects, Deps};
use crate::{error::Error, events::DomainEvent, labels, naming, resolver, selector::Selector};

/// Decides what (if anything) should happen to the local mirror for `remote`,
/// without mutating anything itself. The returned event, if any, goes back
/// onto the work queue for a later drain to actually apply.
pub async fn decide(
    local: &dyn crate::cluster::LocalCluster,
    selector: &Selector,
    target_cluster_name: &str,
    remote: Service,
) -> Result<Option<DomainEvent>, Error> {
    let remote_namespace = remote.metadata.namespace.clone().unwrap_or_default();
    let remote_name = remote.metadata.name.clone().unwrap_or_default();
    let mirror_name = naming::mirror_name(&remote_name, target_cluster_name);
    let remote_labels = remote.metadata.labels.clone().unwrap_or_default();

    let existing_mirror = local.get_service(&remote_namespace, &mirror_name).await?;

    if selector.matches(&remote_labels) {
        return match existing_mirror {
            None => Ok(Some(DomainEvent::RemoteServiceCreated(remote))),
            Some(mirror) => {
                let current_rv = mirror
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(labels::REMOTE_RESOURCE_VERSION_ANNOTATION))
                    .cloned()
                    .unwrap_or_default();
                let remote_rv = remote.metadata.resource_version.clone().unwrap_or_default();

                if current_rv == remote_rv {
                    return Ok(None);
                }

                let endpoints = local
                    .get_endpoints(&remote_namespace, &mirror_name)
                    .await?
                    .ok_or_else(|| {
                        Error::retryable(eyre::eyre!(
                            "mirror endpoints {mirror_name} missing for existing mirror"
                        ))
                    })?;

                Ok(Some(DomainEvent::RemoteServiceUpdated {
                    mirror: Box::new(mirror),
                    endpoints: Box::new(endpoints),
                    remote: Box::new(remote),
                }))
            }
        };
    }

    if existing_mirror.is_some() {
        return Ok(Some(DomainEvent::RemoteServiceDeleted {
            namespace: remote_namespace,
            name: mirror_name,
        }));
    }

    Ok(None)
}

/// `handleRemoteServiceCreated`.
pub async fn handle_created(
    deps: &Deps<'_>,
    remote: Service,
    remote_endpoints: Option<Endpoints>,
) -> Result<(), Error> {
    let remote_namespace = remote.metadata.namespace.clone().unwrap_or_default();

    let gateway_ips =
        resolver::resolve_gateway_addresses(deps.resolver, &deps.link.gateway_addresses()).await?;

    deps.local
        .ensure_namespace(
            &remote_namespace,
            labels::mirror_labels(&deps.link.target_cluster_name),
        )
        .await?;

    let headless_valid =
        deps.enable_headless && objects::is_valid_headless_service(&remote, remote_endpoints.as_ref());

    if headless_valid {
        let mirror = objects::build_mirror_service(objects::MirrorServiceInput {
            remote: &remote,
            target_cluster_name: &deps.link.target_cluster_name,
            target_cluster_domain: &deps.link.target_cluster_domain,
            headless: true,
        });
        deps.local.create_service(mirror).await?;
        tracing::debug!(
            namespace = %remote_namespace,
            name = remote.metadata.name.as_deref().unwrap_or_default(),
            target_cluster_name = %deps.link.target_cluster_name,
            "created headless mirror service; endpoints are built by the headless endpoints mutator"
        );
        return Ok(());
    }

    if objects::is_headless(&remote) && !objects::has_ports(&remote) {
        deps.recorder
            .service_mirroring_skipped(&remote, "remote headless service has no ports to mirror")
            .await;
        return Ok(());
    }

    let mirror = objects::build_mirror_service(objects::MirrorServiceInput {
        remote: &remote,
        target_cluster_name: &deps.link.target_cluster_name,
        target_cluster_domain: &deps.link.target_cluster_domain,
        headless: false,
    });
    let created = deps.local.create_service(mirror).await?;

    let endpoints = objects::build_mirror_endpoints(
        &created,
        &gateway_ips,
        deps.link.gateway_port,
        deps.link.gateway_identity(),
    );

    if let Err(err) = deps.local.create_endpoints(endpoints).await {
        let name = created.metadata.name.clone().unwrap_or_default();
        let _ = deps.local.delete_service(&remote_namespace, &name).await;
        return Err(Error::retryable(eyre::eyre!(
            "creating mirror endpoints for {name}: {err}"
        )));
    }

    tracing::debug!(
        namespace = %remote_namespace,
        name = created.metadata.name.as_deref().unwrap_or_default(),
        target_cluster_name = %deps.link.target_cluster_name,
        "created mirror service and endpoints"
    );

    Ok(())
}

/// `handleRemoteServiceUpdated`. Order matters: endpoints before service, so
/// that a client observing the new service version already sees refreshed
/// endpoints (§5).
pub async fn handle_updated(
    deps: &Deps<'_>,
    mirror: Service,
    endpoints: Endpoints,
    remote: Service,
) -> Result<(), Error> {
    let is_headless_mirror = objects::is_headless(&mirror);

    if is_headless_mirror {
        tracing::debug!(
            name = mirror.metadata.name.as_deref().unwrap_or_default(),
            "skipping non-headless endpoints overwrite for headless mirror; owned by the headless endpoints mutator"
        );
    } else {
        let gateway_ips =
            resolver::resolve_gateway_addresses(deps.resolver, &deps.link.gateway_addresses()).await?;
        let remote_ports = remote
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();
        let mirror_ports = objects::remap_service_ports(remote_ports);

        let mut new_endpoints = endpoints;
        new_endpoints.subsets = Some(vec![EndpointSubset {
            addresses: Some(objects::gateway_endpoint_addresses(&gateway_ips)),
            not_ready_addresses: None,
            ports: Some(objects::gateway_endpoint_ports(
                &mirror_ports,
                deps.link.gateway_port,
            )),
        }]);

        if let Some(identity) = deps.link.gateway_identity() {
            new_endpoints
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(
                    labels::REMOTE_GATEWAY_IDENTITY_ANNOTATION.to_string(),
                    identity.to_string(),
                );
        }

        deps.local.update_endpoints(new_endpoints).await?;
    }

    let mut new_mirror = objects::build_mirror_service(objects::MirrorServiceInput {
        remote: &remote,
        target_cluster_name: &deps.link.target_cluster_name,
        target_cluster_domain: &deps.link.target_cluster_domain,
        headless: is_headless_mirror,
    });
    new_mirror.metadata.resource_version = mirror.metadata.resource_version.clone();
    deps.local.update_service(new_mirror).await?;

    tracing::debug!(
        name = mirror.metadata.name.as_deref().unwrap_or_default(),
        target_cluster_name = %deps.link.target_cluster_name,
        "updated mirror service"
    );

    Ok(())
}

/// `handleRemoteServiceDeleted`. Guards the headless-cleanup branch on a
/// successful mirror fetch (§9 Open Question: the source's unchecked access
/// is not replicated here).
pub async fn handle_deleted(
    local: &dyn crate::cluster::LocalCluster,
    target_cluster_name: &str,
    enable_headless: bool,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let Some(mirror) = local.get_service(namespace, name).await? else {
        return Ok(());
    };

    let mut errors = Vec::new();

    if enable_headless && objects::is_headless(&mirror) {
        let selector = labels::headless_mirror_selector(target_cluster_name, name);
        match local.list_services(namespace, &selector).await {
            Ok(endpoint_mirrors) => {
                for svc in endpoint_mirrors {
                    let svc_name = svc.metadata.name.clone().unwrap_or_default();
                    if let Err(err) = local.delete_endpoints(namespace, &svc_name).await {
                        errors.push(eyre::eyre!(
                            "deleting endpoint-mirror endpoints {svc_name}: {err}"
                        ));
                    }
                    if let Err(err) = local.delete_service(namespace, &svc_name).await {
                        errors.push(eyre::eyre!(
                            "deleting endpoint-mirror service {svc_name}: {err}"
                        ));
                    }
                }
            }
            Err(err) => errors.push(eyre::eyre!("listing endpoint-mirror services: {err}")),
        }
    }

    if let Err(err) = local.delete_endpoints(namespace, name).await {
        errors.push(eyre::eyre!("deleting mirror endpoints {name}: {err}"));
    }
    if let Err(err) = local.delete_service(namespace, name).await {
        errors.push(eyre::eyre!("deleting mirror service {name}: {err}"));
    }

    crate::error::aggregate(errors)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use eyre::Report;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::{
        cluster::fake::FakeCluster, link::Link, recorder::fake::FakeRecorder,
        resolver::Resolve,
    };

    struct FakeResolver(HashMap<String, Vec<std::net::IpAddr>>);

    #[async_trait]
    impl Resolve for FakeResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<std::net::IpAddr>, Report> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| eyre::eyre!("no such host: {host}"))
        }
    }

    fn resolver() -> FakeResolver {
        FakeResolver(HashMap::from([(
            "10.0.0.1".to_string(),
            vec!["10.0.0.1".parse().unwrap()],
        )]))
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

    fn remote_service(name: &str, namespace: &str, resource_version: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(resource_version.to_string()),
                labels: Some(std::collections::BTreeMap::from([(
                    "mirror.linkerd.io/exported".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                cluster_ip: Some("10.1.2.3".to_string()),
                ports: Some(vec![k8s_openapi::api::core::v1::ServicePort {
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
    async fn scenario_1_create() {
        let local = FakeCluster::new();
        let selector = Selector::parse(&link().selector).unwrap();
        let remote = remote_service("foo", "app", "100");

        let decision = decide(&local, &selector, "west", remote.clone()).await.unwrap();
        assert!(matches!(decision, Some(DomainEvent::RemoteServiceCreated(_))));

        let recorder = FakeRecorder::new();
        let resolver = resolver();
        let link = link();
        let deps = Deps {
            local: &local,
            resolver: &resolver,
            recorder: &recorder,
            link: &link,
            enable_headless: true,
        };

        handle_created(&deps, remote, None).await.unwrap();

        let mirror = local.get_service("app", "foo-west").await.unwrap().unwrap();
        assert_eq!(
            mirror
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(labels::REMOTE_SVC_FQ_NAME_ANNOTATION)
                .map(String::as_str),
            Some("foo.app.svc.cluster.local")
        );

        let endpoints = local.get_endpoints("app", "foo-west").await.unwrap().unwrap();
        let subset = &endpoints.subsets.as_ref().unwrap()[0];
        assert_eq!(subset.addresses.as_ref().unwrap()[0].ip, "10.0.0.1");
        assert_eq!(subset.ports.as_ref().unwrap()[0].port, 4143);
    }

    #[tokio::test]
    async fn scenario_2_update() {
        let local = FakeCluster::new();
        let selector = Selector::parse(&link().selector).unwrap();
        let recorder = FakeRecorder::new();
        let resolver = resolver();
        let link = link();
        let deps = Deps {
            local: &local,
            resolver: &resolver,
            recorder: &recorder,
            link: &link,
            enable_headless: true,
        };

        let remote_v1 = remote_service("foo", "app", "100");
        handle_created(&deps, remote_v1.clone(), None).await.unwrap();

        let mut remote_v2 = remote_service("foo", "app", "101");
        remote_v2
            .spec
            .as_mut()
            .unwrap()
            .ports
            .as_mut()
            .unwrap()
            .push(k8s_openapi::api::core::v1::ServicePort {
                name: Some("grpc".to_string()),
                protocol: Some("TCP".to_string()),
                port: 9090,
                ..Default::default()
            });

        let decision = decide(&local, &selector, "west", remote_v2.clone())
            .await
            .unwrap();
        let Some(DomainEvent::RemoteServiceUpdated {
            mirror,
            endpoints,
            remote,
        }) = decision
        else {
            panic!("expected RemoteServiceUpdated");
        };

        handle_updated(&deps, *mirror, *endpoints, *remote).await.unwrap();

        let mirror = local.get_service("app", "foo-west").await.unwrap().unwrap();
        let ports = mirror.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(
            mirror
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(labels::REMOTE_RESOURCE_VERSION_ANNOTATION)
                .map(String::as_str),
            Some("101")
        );

        let endpoints = local.get_endpoints("app", "foo-west").await.unwrap().unwrap();
        let ports = endpoints.subsets.as_ref().unwrap()[0].ports.as_ref().unwrap();
        assert!(ports.iter().all(|p| p.port == 4143));
        assert_eq!(ports.len(), 2);
    }

    #[tokio::test]
    async fn scenario_3_selector_stops_matching_deletes_mirror() {
        let local = FakeCluster::new();
        let selector = Selector::parse(&link().selector).unwrap();
        let recorder = FakeRecorder::new();
        let resolver = resolver();
        let link = link();
        let deps = Deps {
            local: &local,
            resolver: &resolver,
            recorder: &recorder,
            link: &link,
            enable_headless: true,
        };

        let remote = remote_service("foo", "app", "100");
        handle_created(&deps, remote.clone(), None).await.unwrap();

        let mut unselected = remote.clone();
        unselected.metadata.labels = Some(std::collections::BTreeMap::new());

        let decision = decide(&local, &selector, "west", unselected).await.unwrap();
        let Some(DomainEvent::RemoteServiceDeleted { namespace, name }) = decision else {
            panic!("expected RemoteServiceDeleted");
        };

        handle_deleted(&local, "west", true, &namespace, &name).await.unwrap();

        assert!(local.get_service("app", "foo-west").await.unwrap().is_none());
        assert!(local.get_endpoints("app", "foo-west").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotent_create_is_a_no_op_on_replay() {
        let local = FakeCluster::new();
        let recorder = FakeRecorder::new();
        let resolver = resolver();
        let link = link();
        let deps = Deps {
            local: &local,
            resolver: &resolver,
            recorder: &recorder,
            link: &link,
            enable_headless: true,
        };

        let remote = remote_service("foo", "app", "100");
        handle_created(&deps, remote.clone(), None).await.unwrap();
        handle_created(&deps, remote, None).await.unwrap();

        let mirror = local.get_service("app", "foo-west").await.unwrap().unwrap();
        assert_eq!(mirror.metadata.name.as_deref(), Some("foo-west"));
    }

    #[tokio::test]
    async fn repeated_delete_is_a_no_op() {
        let local = FakeCluster::new();
        handle_deleted(&local, "west", true, "app", "foo-west").await.unwrap();
        handle_deleted(&local, "west", true, "app", "foo-west").await.unwrap();
    }
}
