//! Headless Endpoints Mutator (§4.5) and Endpoint-Mirror Service Creation
//! (§4.6). Invoked on `OnAddEndpointsCalled` / `OnUpdateEndpointsCalled`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Endpoints, Service};

use super::{objects, objects::HostnameField, Deps};
use crate::{error::Error, labels, naming, resolver};

/// Given exported endpoints `E`, fetches the corresponding remote service,
/// then creates or updates the headless-mirror endpoints and its
/// endpoint-mirror services.
pub async fn handle_endpoints(
    deps: &Deps<'_>,
    remote_cluster: &dyn crate::cluster::RemoteCluster,
    endpoints: Endpoints,
) -> Result<(), Error> {
    if !deps.enable_headless {
        return Ok(());
    }

    let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
    let service_name = endpoints.metadata.name.clone().unwrap_or_default();

    let remote = remote_cluster
        .get_service(&namespace, &service_name)
        .await?
        .ok_or_else(|| {
            Error::terminal(eyre::eyre!(
                "remote service {namespace}/{service_name} missing for exported endpoints"
            ))
        })?;

    if !objects::has_ports(&remote) || !objects::is_valid_headless_service(&remote, Some(&endpoints)) {
        return Ok(());
    }

    let mirror_name = naming::mirror_name(&service_name, &deps.link.target_cluster_name);
    let hostnames = objects::named_hostnames(&endpoints);

    let mut hostname_ips = BTreeMap::new();
    for hostname in &hostnames {
        let service =
            ensure_endpoint_mirror_service(deps, &remote, &endpoints, hostname, &mirror_name)
                .await?;
        let cluster_ip = service
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .unwrap_or_default();
        hostname_ips.insert(hostname.clone(), cluster_ip);
    }

    let existing_mirror_endpoints = deps.local.get_endpoints(&namespace, &mirror_name).await?;

    match existing_mirror_endpoints {
        None => {
            let subsets =
                objects::build_headless_subsets(&endpoints, &hostname_ips, HostnameField::FromTargetRefName);
            if subsets.is_empty() {
                return Ok(());
            }

            let headless_endpoints = Endpoints {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(mirror_name.clone()),
                    namespace: Some(namespace.clone()),
                    labels: Some(labels::mirror_labels(&deps.link.target_cluster_name)),
                    annotations: Some(BTreeMap::from([(
                        labels::REMOTE_SVC_FQ_NAME_ANNOTATION.to_string(),
                        naming::service_fq_name(
                            &service_name,
                            &namespace,
                            &deps.link.target_cluster_domain,
                        ),
                    )])),
                    ..Default::default()
                },
                subsets: Some(subsets),
            };

            if let Err(err) = deps.local.create_endpoints(headless_endpoints).await {
                let _ = deps.local.delete_service(&namespace, &mirror_name).await;
                return Err(Error::retryable(eyre::eyre!(
                    "creating headless mirror endpoints {mirror_name}: {err}"
                )));
            }
        }
        Some(existing) => {
            let subsets =
                objects::build_headless_subsets(&endpoints, &hostname_ips, HostnameField::FromHostname);
            if subsets.is_empty() {
                return Ok(());
            }

            let seen: std::collections::HashSet<&String> = hostnames.iter().collect();
            let selector = labels::headless_mirror_selector(&deps.link.target_cluster_name, &mirror_name);
            let mut errors = Vec::new();

            match deps.local.list_services(&namespace, &selector).await {
                Ok(endpoint_mirrors) => {
                    for svc in endpoint_mirrors {
                        let svc_name = svc.metadata.name.clone().unwrap_or_default();
                        let hostname = naming::original_name(&svc_name, &deps.link.target_cluster_name)
                            .unwrap_or_else(|| svc_name.clone());
                        if seen.contains(&hostname) {
                            continue;
                        }
                        if let Err(err) = deps.local.delete_endpoints(&namespace, &svc_name).await {
                            errors.push(eyre::eyre!("deleting stale endpoint-mirror endpoints {svc_name}: {err}"));
                        }
                        if let Err(err) = deps.local.delete_service(&namespace, &svc_name).await {
                            errors.push(eyre::eyre!("deleting stale endpoint-mirror service {svc_name}: {err}"));
                        }
                    }
                }
                Err(err) => errors.push(eyre::eyre!("listing endpoint-mirror services: {err}")),
            }

            let mut updated = existing;
            updated.subsets = Some(subsets);
            if let Err(err) = deps.local.update_endpoints(updated).await {
                errors.push(eyre::eyre!("updating headless mirror endpoints {mirror_name}: {err}"));
            }

            crate::error::aggregate(errors)?;
        }
    }

    Ok(())
}

/// `{hostname}-{targetClusterName}` service creation (§4.6), idempotent on
/// `AlreadyExists` (tolerated at the [`crate::cluster::KubeCluster`] layer).
async fn ensure_endpoint_mirror_service(
    deps: &Deps<'_>,
    remote: &Service,
    remote_endpoints: &Endpoints,
    hostname: &str,
    headless_mirror_name: &str,
) -> Result<Service, Error> {
    let namespace = remote.metadata.namespace.clone().unwrap_or_default();
    let endpoint_mirror_name = naming::endpoint_mirror_name(hostname, &deps.link.target_cluster_name);

    if let Some(existing) = deps.local.get_service(&namespace, &endpoint_mirror_name).await? {
        return Ok(existing);
    }

    let gateway_ips =
        resolver::resolve_gateway_addresses(deps.resolver, &deps.link.gateway_addresses()).await?;

    let service = objects::build_endpoint_mirror_service(objects::EndpointMirrorServiceInput {
        hostname,
        remote,
        remote_endpoints_resource_version: remote_endpoints
            .metadata
            .resource_version
            .as_deref()
            .unwrap_or_default(),
        target_cluster_name: &deps.link.target_cluster_name,
        target_cluster_domain: &deps.link.target_cluster_domain,
        headless_mirror_name,
    });

    let created = deps.local.create_service(service).await?;

    let endpoints = objects::build_endpoint_mirror_endpoints(
        &created,
        &gateway_ips,
        deps.link.gateway_port,
        deps.link.gateway_identity(),
    );

    if let Err(err) = deps.local.create_endpoints(endpoints).await {
        let name = created.metadata.name.clone().unwrap_or_default();
        let _ = deps.local.delete_service(&namespace, &name).await;
        return Err(Error::retryable(eyre::eyre!(
            "creating endpoint-mirror endpoints {name}: {err}"
        )));
    }

    Ok(created)
}
