//! The `Link`: read-only configuration identifying one remote cluster to mirror
//! from. Parsing the real link CRD is out of scope for this core (§1); this is
//! the minimal constructible surface the reconciler needs, filled in directly
//! from CLI flags rather than an API object.

use clap::Args;
use eyre::{ensure, Result};

use crate::selector::Selector;

#[derive(Debug, Clone, Args)]
pub struct Link {
    /// Name of the remote cluster. Used as a label value and as the mirror name
    /// suffix.
    #[arg(long, env = "RCSW_TARGET_CLUSTER_NAME")]
    pub target_cluster_name: String,

    /// DNS suffix of the remote cluster, used to build `remote-svc-fq-name`.
    #[arg(long, env = "RCSW_TARGET_CLUSTER_DOMAIN")]
    pub target_cluster_domain: String,

    /// Comma-separated host/IP list for the remote gateway.
    #[arg(long, env = "RCSW_GATEWAY_ADDRESS")]
    pub gateway_address: String,

    /// Port the gateway listens on; all non-headless mirror endpoints are
    /// remapped to this port.
    #[arg(long, env = "RCSW_GATEWAY_PORT")]
    pub gateway_port: u16,

    /// Opaque gateway identity, stamped onto the `remote-gateway-identity`
    /// annotation. Empty means unset.
    #[arg(long, env = "RCSW_GATEWAY_IDENTITY", default_value = "")]
    pub gateway_identity: String,

    /// Port the external gateway health prober connects to.
    #[arg(long, env = "RCSW_PROBE_PORT")]
    pub probe_port: u16,

    /// Label selector matching remote services to mirror.
    #[arg(long, env = "RCSW_SELECTOR", default_value = "")]
    pub selector: String,
}

impl Link {
    /// Validates the raw CLI input and parses the selector eagerly -- a
    /// malformed selector is a startup-time configuration error.
    pub fn validate(&self) -> Result<Selector> {
        ensure!(
            !self.target_cluster_name.is_empty(),
            "target-cluster-name must not be empty"
        );
        ensure!(
            !self.target_cluster_domain.is_empty(),
            "target-cluster-domain must not be empty"
        );
        ensure!(
            !self.gateway_address.trim().is_empty(),
            "gateway-address must not be empty"
        );
        ensure!(self.gateway_port != 0, "gateway-port must be in 1..=65535");
        ensure!(self.probe_port != 0, "probe-port must be in 1..=65535");

        Selector::parse(&self.selector)
    }

    pub fn gateway_identity(&self) -> Option<&str> {
        if self.gateway_identity.is_empty() {
            None
        } else {
            Some(&self.gateway_identity)
        }
    }

    pub fn gateway_addresses(&self) -> Vec<String> {
        self.gateway_address
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}
