//! Gateway address resolution (§4.8). Each comma-separated token on the `Link`
//! is resolved independently and concurrently; partial resolution is
//! acceptable -- only a total failure is retryable.

use std::net::IpAddr;

use async_trait::async_trait;
use eyre::Report;
use futures::future::join_all;
use hickory_resolver::{config::ResolverConfig, TokioAsyncResolver};

use crate::error::Error;

/// Resolves a single host/IP token to one or more addresses. Split out as a
/// trait so tests can stub resolution without touching the network.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Report>;
}

pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self, Error> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map(|(c, o)| (c, o))
            .unwrap_or_else(|_| (ResolverConfig::default(), Default::default()));
        opts.ip_strategy = hickory_resolver::config::LookupIpStrategy::Ipv4thenIpv6;

        Ok(Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Report> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let lookup = self.inner.lookup_ip(host).await?;
        Ok(lookup.iter().collect())
    }
}

/// Resolves every token in `gateway_address`, collecting whatever succeeds.
/// Returns a retryable error only when nothing at all resolved (§4.8).
pub async fn resolve_gateway_addresses(
    resolver: &dyn Resolve,
    hosts: &[String],
) -> Result<Vec<IpAddr>, Error> {
    let attempts = join_all(hosts.iter().map(|host| async move {
        resolver
            .resolve(host)
            .await
            .map_err(|err| err.wrap_err(format!("resolving gateway address {host:?}")))
    }))
    .await;

    let mut addresses = Vec::new();
    let mut failures = Vec::new();

    for attempt in attempts {
        match attempt {
            Ok(ips) => addresses.extend(ips),
            Err(err) => failures.push(err),
        }
    }

    if addresses.is_empty() {
        return crate::error::aggregate(failures).map(|()| Vec::new());
    }

    for failure in failures {
        tracing::debug!(error = %failure, "gateway address resolution partially failed");
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::Ipv4Addr};

    use super::*;

    struct FakeResolver(HashMap<String, Vec<IpAddr>>);

    #[async_trait]
    impl Resolve for FakeResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Report> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| eyre::eyre!("no such host: {host}"))
        }
    }

    #[tokio::test]
    async fn resolves_all_hosts() {
        let resolver = FakeResolver(HashMap::from([(
            "gateway.example".to_string(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
        )]));

        let resolved = resolve_gateway_addresses(&resolver, &["gateway.example".to_string()])
            .await
            .unwrap();

        assert_eq!(resolved, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
    }

    #[tokio::test]
    async fn partial_resolution_succeeds() {
        let resolver = FakeResolver(HashMap::from([(
            "good.example".to_string(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
        )]));

        let resolved = resolve_gateway_addresses(
            &resolver,
            &["good.example".to_string(), "bad.example".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(resolved, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
    }

    #[tokio::test]
    async fn total_failure_is_retryable() {
        let resolver = FakeResolver(HashMap::new());

        let err = resolve_gateway_addresses(&resolver, &["nx.example".to_string()])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }
}
