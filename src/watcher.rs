//! Wires the remote Resource Watchers, the [`Translator`], the [`WorkQueue`],
//! the [`Reconciler`] and the Periodic Scheduler into one running
//! `RemoteClusterServiceWatcher` (§2, §6). The watch cache is a
//! `reflector`-backed `kube::runtime::watcher` pipeline; shutdown aborts the
//! spawned tasks on `Drop` rather than waiting for them to notice the stop
//! signal.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use derive_builder::Builder;
use eyre::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    runtime::{
        self,
        reflector::{self, ObjectRef, Store},
        watcher::{Config, Event},
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use tokio::{sync::watch, task::JoinHandle, time::interval};

use crate::{
    cluster::{KubeCluster, RemoteCluster},
    error::Error,
    events::RawDelete,
    link::Link,
    metrics::Metrics,
    mutators::Deps,
    queue::WorkQueue,
    reconciler::Reconciler,
    recorder::Record,
    resolver::Resolve,
    selector::Selector,
    translator::Translator,
};

/// `RemoteCluster` backed by the watch caches this module maintains, rather
/// than a live `get` per call -- the cache `crate::cluster`'s module doc
/// points forward to.
struct CachedRemoteCluster {
    services: Store<Service>,
    endpoints: Store<Endpoints>,
}

#[async_trait]
impl RemoteCluster for CachedRemoteCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self
            .services
            .get(&ObjectRef::new(name).within(namespace))
            .map(|svc| (*svc).clone()))
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        Ok(self
            .endpoints
            .get(&ObjectRef::new(name).within(namespace))
            .map(|ep| (*ep).clone()))
    }
}

/// Everything needed to construct one [`RemoteClusterServiceWatcher`] (§2's
/// `NewRemoteClusterServiceWatcher(...)` parameter list, minus the context).
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct WatcherConfig {
    pub local_client: Client,
    pub remote_client: Client,
    pub link: Link,
    pub selector: Selector,
    pub recorder: Arc<dyn Record>,
    pub resolver: Arc<dyn Resolve>,
    pub controller_namespace: String,
    #[builder(default = "3")]
    pub requeue_limit: u32,
    #[builder(default = "Duration::from_secs(60)")]
    pub repair_period: Duration,
    #[builder(default = "true")]
    pub enable_headless: bool,
}

/// One running instance of the reconciliation core against a single `Link`
/// (§2: one RCSW per remote cluster). `start` spawns the watchers and the
/// periodic scheduler as detached tasks, then drains the queue on the calling
/// task until `stop` is invoked -- the drain is awaited directly rather than
/// raced against the spawned tasks, so a stop signal can never cancel a
/// reconcile mid-flight (§5 "API operations in flight run to completion").
pub struct RemoteClusterServiceWatcher {
    config: WatcherConfig,
    metrics: Metrics,
    queue: Arc<WorkQueue>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteClusterServiceWatcher {
    pub fn new(config: WatcherConfig) -> Result<Self, Error> {
        let metrics = Metrics::new().map_err(|err| Error::terminal(eyre::eyre!(err)))?;
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            config,
            metrics,
            queue: Arc::new(WorkQueue::new()),
            stop_tx,
            stop_rx,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawns the remote Service/Endpoints watchers and the repair scheduler,
    /// triggers the startup orphan GC, then drains the queue until `stop`
    /// shuts it down (§6 "Start(ctx) -> error").
    pub async fn start(&self) -> Result<(), Error> {
        let (service_store, service_task) = spawn_service_watch(
            self.config.remote_client.clone(),
            self.queue.clone(),
            self.config.selector.clone(),
            self.stop_rx.clone(),
        );
        let (endpoints_store, endpoints_task) = spawn_endpoints_watch(
            self.config.remote_client.clone(),
            self.queue.clone(),
            self.config.selector.clone(),
            self.stop_rx.clone(),
        );
        let repair_task = spawn_repair_scheduler(
            self.queue.clone(),
            self.config.selector.clone(),
            self.config.repair_period,
            self.stop_rx.clone(),
        );

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(service_task);
            tasks.push(endpoints_task);
            tasks.push(repair_task);
        }

        let translator = Translator::new(&self.queue, &self.config.selector);
        translator.trigger_orphan_gc();

        let local = KubeCluster::new(self.config.local_client.clone());
        let remote = CachedRemoteCluster {
            services: service_store,
            endpoints: endpoints_store,
        };
        let deps = Deps {
            local: &local,
            resolver: self.config.resolver.as_ref(),
            recorder: self.config.recorder.as_ref(),
            link: &self.config.link,
            enable_headless: self.config.enable_headless,
        };
        let reconciler = Reconciler {
            queue: self.queue.clone(),
            deps,
            selector: &self.config.selector,
            remote: &remote,
            metrics: &self.metrics,
            controller_namespace: self.config.controller_namespace.clone(),
            requeue_limit: self.config.requeue_limit,
        };

        reconciler.run().await;

        Ok(())
    }

    /// Signals every spawned task to stop and, if `cleanup` is set, enqueues
    /// `ClusterUnregistered` first so the in-flight `start()` call's drain
    /// loop tears down every mirrored object before exiting (§4.7, §6
    /// "Stop(cleanupState bool)").
    pub fn stop(&self, cleanup: bool) {
        if cleanup {
            let translator = Translator::new(&self.queue, &self.config.selector);
            translator.trigger_cluster_unregistered();
        }

        let _ = self.stop_tx.send(true);
        self.queue.shut_down();
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Drop for RemoteClusterServiceWatcher {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Builds the reflector-backed watch cache for remote Services and spawns the
/// task that both maintains it and feeds the [`Translator`] (§9: `Applied` is
/// treated identically whether it's the object's first observation or a
/// version bump -- `service::decide` is idempotent either way, so there's no
/// need to track "have we seen this key before" here).
fn spawn_service_watch(
    client: Client,
    queue: Arc<WorkQueue>,
    selector: Selector,
    mut stop_rx: watch::Receiver<bool>,
) -> (Store<Service>, JoinHandle<()>) {
    let (reader, writer) = reflector::store();
    let mut stream = runtime::watcher(Api::<Service>::all(client), Config::default())
        .default_backoff()
        .modify(|obj| {
            ResourceExt::managed_fields_mut(obj).clear();
        })
        .reflect(writer)
        .boxed();

    let handle = tokio::spawn(async move {
        let translator = Translator::new(&queue, &selector);
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Applied(svc))) => translator.on_update(svc),
                        Some(Ok(Event::Deleted(svc))) => translator.on_delete(RawDelete::Live(svc)),
                        Some(Ok(Event::Restarted(objs))) => {
                            for svc in objs {
                                translator.on_update(svc);
                            }
                        }
                        Some(Err(err)) => tracing::warn!(%err, "service watch stream error"),
                        None => break,
                    }
                }
            }
        }
    });

    (reader, handle)
}

fn spawn_endpoints_watch(
    client: Client,
    queue: Arc<WorkQueue>,
    selector: Selector,
    mut stop_rx: watch::Receiver<bool>,
) -> (Store<Endpoints>, JoinHandle<()>) {
    let (reader, writer) = reflector::store();
    let mut stream = runtime::watcher(Api::<Endpoints>::all(client), Config::default())
        .default_backoff()
        .modify(|obj| {
            ResourceExt::managed_fields_mut(obj).clear();
        })
        .reflect(writer)
        .boxed();

    let handle = tokio::spawn(async move {
        let translator = Translator::new(&queue, &selector);
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Applied(ep))) => translator.on_update_endpoints(ep),
                        Some(Ok(Event::Deleted(ep))) => {
                            translator.on_delete_endpoints(RawDelete::Live(ep));
                        }
                        Some(Ok(Event::Restarted(objs))) => {
                            for ep in objs {
                                translator.on_update_endpoints(ep);
                            }
                        }
                        Some(Err(err)) => tracing::warn!(%err, "endpoints watch stream error"),
                        None => break,
                    }
                }
            }
        }
    });

    (reader, handle)
}

/// Enqueues `RepairEndpoints` immediately on start, then every `repair_period`
/// (§4.1 "RepairEndpoints immediately on start then every repairPeriod" --
/// `tokio::time::interval`'s first tick fires right away, so no separate
/// "immediate" call is needed).
fn spawn_repair_scheduler(
    queue: Arc<WorkQueue>,
    selector: Selector,
    repair_period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let translator = Translator::new(&queue, &selector);
        let mut ticks = interval(repair_period);
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticks.tick() => {
                    translator.trigger_repair();
                }
            }
        }
    })
}
