//! Wire-stable labels and annotations. External tooling depends on these keys,
//! so they are centralized here rather than inlined at each call site.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

pub const MIRRORED_LABEL: &str = "mirror.linkerd.io/mirrored-service";
pub const CLUSTER_NAME_LABEL: &str = "mirror.linkerd.io/cluster-name";
pub const HEADLESS_MIRROR_SVC_NAME_LABEL: &str = "mirror.linkerd.io/headless-mirror-svc-name";

pub const REMOTE_RESOURCE_VERSION_ANNOTATION: &str = "mirror.linkerd.io/remote-resource-version";
pub const REMOTE_SVC_FQ_NAME_ANNOTATION: &str = "mirror.linkerd.io/remote-svc-fq-name";
pub const REMOTE_GATEWAY_IDENTITY_ANNOTATION: &str = "mirror.linkerd.io/remote-gateway-identity";
pub const OPAQUE_PORTS_ANNOTATION: &str = "config.linkerd.io/opaque-ports";

pub const HEADLESS_SVC_LABEL: &str = "service.kubernetes.io/headless";

pub const SERVICE_MIRRORING_SKIPPED_REASON: &str = "ServiceMirroringSkipped";

/// Every object this core creates carries these two labels (I2).
pub fn mirror_labels(target_cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MIRRORED_LABEL.to_string(), "true".to_string()),
        (CLUSTER_NAME_LABEL.to_string(), target_cluster_name.to_string()),
    ])
}

pub fn endpoint_mirror_labels(
    target_cluster_name: &str,
    headless_mirror_name: &str,
) -> BTreeMap<String, String> {
    let mut labels = mirror_labels(target_cluster_name);
    labels.insert(
        HEADLESS_MIRROR_SVC_NAME_LABEL.to_string(),
        headless_mirror_name.to_string(),
    );
    labels
}

pub fn is_mirror_label_selector(target_cluster_name: &str) -> String {
    format!("{MIRRORED_LABEL}=true,{CLUSTER_NAME_LABEL}={target_cluster_name}")
}

pub fn headless_mirror_selector(target_cluster_name: &str, headless_mirror_name: &str) -> String {
    format!(
        "{MIRRORED_LABEL}=true,{CLUSTER_NAME_LABEL}={target_cluster_name},{HEADLESS_MIRROR_SVC_NAME_LABEL}={headless_mirror_name}"
    )
}

/// `proxy-opaque-ports`-style passthrough: copy the annotation across verbatim
/// if the remote carries it, otherwise leave it unset.
pub fn opaque_ports_passthrough(remote: &Service) -> Option<String> {
    remote
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OPAQUE_PORTS_ANNOTATION))
        .cloned()
}
