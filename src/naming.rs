//! The wire-stable naming scheme tying remote objects to their local mirrors.
//!
//! `mirror_name` and `original_name` must round-trip: `original_name(mirror_name(x,
//! c), c) == Some(x)` for any `x` that doesn't itself contain a `-{c}` suffix
//! collision. Orphan GC depends on this.

pub fn mirror_name(remote_name: &str, target_cluster_name: &str) -> String {
    format!("{remote_name}-{target_cluster_name}")
}

pub fn original_name(mirror_name: &str, target_cluster_name: &str) -> Option<String> {
    let suffix = format!("-{target_cluster_name}");
    mirror_name.strip_suffix(&suffix).map(ToString::to_string)
}

pub fn endpoint_mirror_name(hostname: &str, target_cluster_name: &str) -> String {
    format!("{hostname}-{target_cluster_name}")
}

pub fn gateway_probe_name(target_cluster_name: &str) -> String {
    format!("probe-gateway-{target_cluster_name}")
}

pub fn service_fq_name(
    remote_name: &str,
    remote_namespace: &str,
    target_cluster_domain: &str,
) -> String {
    format!("{remote_name}.{remote_namespace}.svc.{target_cluster_domain}")
}

pub fn endpoint_mirror_fq_name(
    hostname: &str,
    remote_name: &str,
    remote_namespace: &str,
    target_cluster_domain: &str,
) -> String {
    format!("{hostname}.{remote_name}.{remote_namespace}.svc.{target_cluster_domain}")
}
