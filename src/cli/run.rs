//! The `run` subcommand: wires CLI flags into a [`Link`] and a
//! [`WatcherConfig`], then starts one [`RemoteClusterServiceWatcher`] and
//! waits for `SIGTERM`.

use std::{path::PathBuf, sync::Arc};

use cata::{Command, Container};
use clap::Parser;
use eyre::{Result, WrapErr};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};

use crate::{
    link::Link,
    recorder::{Record, Recorder},
    resolver::{DnsResolver, Resolve},
    watcher::{RemoteClusterServiceWatcher, WatcherConfigBuilder},
};

#[derive(Parser, Container)]
pub struct Run {
    #[command(flatten)]
    pub link: Link,

    /// Namespace this controller's own objects (the gateway-probe endpoints)
    /// live in.
    #[arg(
        long,
        env = "RCSW_CONTROLLER_NAMESPACE",
        default_value = "linkerd-multicluster"
    )]
    pub controller_namespace: String,

    /// Kubeconfig file for the *remote* cluster. Defaults to the ambient
    /// kubeconfig used for the local cluster when unset.
    #[arg(long, env = "RCSW_REMOTE_KUBECONFIG")]
    pub remote_kubeconfig: Option<PathBuf>,

    /// Context within the kubeconfig to use for the remote cluster.
    #[arg(long, env = "RCSW_REMOTE_CONTEXT")]
    pub remote_context: Option<String>,

    /// Requeues a retryable failure survives before it's given up on.
    #[arg(long, env = "RCSW_REQUEUE_LIMIT", default_value_t = 3)]
    pub requeue_limit: u32,

    /// How often mirror endpoints are re-derived from the resolved gateway
    /// addresses.
    #[arg(long, env = "RCSW_REPAIR_PERIOD", default_value = "60s")]
    pub repair_period: humantime::Duration,

    /// Whether to additionally mirror headless services (§4.5/§4.6).
    #[arg(long, env = "RCSW_ENABLE_HEADLESS", default_value_t = true)]
    pub enable_headless: bool,
}

#[derive(Serialize)]
struct RunSummary {
    target_cluster_name: String,
    controller_namespace: String,
    enable_headless: bool,
}

/// Builds the `kube::Client` for the remote cluster. With neither flag set
/// this is the same ambient config the local cluster uses; `remote_context`
/// alone selects a different context out of the default kubeconfig,
/// `remote_kubeconfig` points at an entirely different file.
async fn remote_client(kubeconfig: Option<&PathBuf>, context: Option<&str>) -> Result<Client> {
    if kubeconfig.is_none() && context.is_none() {
        return Ok(Client::try_from(Config::infer().await?)?);
    }

    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .wrap_err_with(|| format!("reading remote kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None => Config::from_kubeconfig(&options).await?,
    };

    Ok(Client::try_from(config)?)
}

#[async_trait::async_trait]
impl Command for Run {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "run"))]
    async fn run(&self) -> Result<()> {
        let selector = self.link.validate()?;

        let local_client = Client::try_default()
            .await
            .wrap_err("connecting to the local cluster")?;
        let remote_client = remote_client(self.remote_kubeconfig.as_ref(), self.remote_context.as_deref())
            .await
            .wrap_err("connecting to the remote cluster")?;

        let summary = RunSummary {
            target_cluster_name: self.link.target_cluster_name.clone(),
            controller_namespace: self.controller_namespace.clone(),
            enable_headless: self.enable_headless,
        };
        tracing::info!(
            summary = %serde_json::to_string(&summary)?,
            "starting remote cluster service watcher"
        );

        let recorder: Arc<dyn Record> = Arc::new(Recorder::new(local_client.clone(), "rcsw".into()));
        let resolver: Arc<dyn Resolve> =
            Arc::new(DnsResolver::from_system_conf().map_err(|err| eyre::eyre!(err.to_string()))?);

        let config = WatcherConfigBuilder::default()
            .local_client(local_client)
            .remote_client(remote_client)
            .link(self.link.clone())
            .selector(selector)
            .recorder(recorder)
            .resolver(resolver)
            .controller_namespace(self.controller_namespace.clone())
            .requeue_limit(self.requeue_limit)
            .repair_period(self.repair_period.into())
            .enable_headless(self.enable_headless)
            .build()
            .wrap_err("building watcher config")?;

        let watcher = Arc::new(
            RemoteClusterServiceWatcher::new(config).map_err(|err| eyre::eyre!(err.to_string()))?,
        );

        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.start().await }
        });

        let mut sigterm = signal(SignalKind::terminate())?;
        sigterm.recv().await;
        tracing::info!("received SIGTERM, shutting down");
        watcher.stop(true);

        handle
            .await?
            .map_err(|err| eyre::eyre!(err.to_string()))
            .wrap_err("watcher exited with an error")?;

        Ok(())
    }
}
