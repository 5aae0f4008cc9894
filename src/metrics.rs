//! The repair-invocation counter (§4.9) and its registration point. The
//! Prometheus exposition HTTP handler itself stays out of scope (§1); this
//! just registers the counter against a process-wide registry so that a
//! handler could serve it later.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    repairs_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let repairs_total = IntCounterVec::new(
            Opts::new(
                "rcsw_repair_endpoints_total",
                "Number of times repairEndpoints has run, labelled by target cluster.",
            ),
            &["target_cluster_name"],
        )?;

        registry.register(Box::new(repairs_total.clone()))?;

        Ok(Self {
            registry,
            repairs_total,
        })
    }

    pub fn record_repair(&self, target_cluster_name: &str) {
        self.repairs_total
            .with_label_values(&[target_cluster_name])
            .inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the Prometheus text exposition format; the
    /// (out-of-scope) HTTP handler would call this per-scrape.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_increment_the_right_label() {
        let metrics = Metrics::new().unwrap();
        metrics.record_repair("west");
        metrics.record_repair("west");
        metrics.record_repair("east");

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("target_cluster_name=\"west\"} 2"));
        assert!(encoded.contains("target_cluster_name=\"east\"} 1"));
    }
}
