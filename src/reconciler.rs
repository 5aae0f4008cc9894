//! Single-worker drain loop (§4.2): pulls [`DomainEvent`]s off the
//! [`WorkQueue`] and dispatches each to its mutator. Retryable failures are
//! re-enqueued with backoff up to `requeue_limit`; anything else is logged and
//! dropped.

use std::sync::Arc;

use crate::{
    error::Error,
    events::DomainEvent,
    metrics::Metrics,
    mutators::{headless, repair, service, Deps},
    queue::WorkQueue,
    selector::Selector,
};

pub struct Reconciler<'a> {
    pub queue: Arc<WorkQueue>,
    pub deps: Deps<'a>,
    pub selector: &'a Selector,
    pub remote: &'a dyn crate::cluster::RemoteCluster,
    pub metrics: &'a Metrics,
    pub controller_namespace: String,
    pub requeue_limit: u32,
}

impl<'a> Reconciler<'a> {
    /// Drains the queue until it's empty and shut down. Runs on a single task
    /// -- the queue already serializes concurrent producers, and every
    /// mutator assumes it's the sole writer for this link's mirrored
    /// resources at any given moment.
    pub async fn run(&self) {
        while let Some(event) = self.queue.get().await {
            let variant = event.variant_name();
            match self.dispatch(event.clone()).await {
                Ok(()) => {
                    self.queue.forget(&event);
                }
                Err(Error::Retryable(report)) => {
                    if self.queue.is_shutting_down()
                        || self.queue.num_requeues(&event) >= self.requeue_limit
                    {
                        tracing::warn!(
                            %variant,
                            error = %report,
                            "giving up after exceeding requeue limit"
                        );
                        self.queue.forget(&event);
                    } else {
                        tracing::debug!(%variant, error = %report, "retrying");
                        self.queue.add_rate_limited(event.clone());
                    }
                }
                Err(Error::Terminal(report)) => {
                    tracing::warn!(%variant, error = %report, "dropping non-retryable failure");
                    self.queue.forget(&event);
                }
            }
            self.queue.done(&event);
        }
    }

    async fn dispatch(&self, event: DomainEvent) -> Result<(), Error> {
        match event {
            DomainEvent::OnAddCalled(remote) | DomainEvent::OnUpdateCalled(remote) => {
                let decision = service::decide(
                    self.deps.local,
                    self.selector,
                    &self.deps.link.target_cluster_name,
                    remote,
                )
                .await?;
                if let Some(next) = decision {
                    self.queue.add(next);
                }
                Ok(())
            }
            DomainEvent::OnDeleteCalled(remote) => {
                // The remote object is already gone; unlike add/update there is no
                // "still matches the selector, no-op" case to decide -- the mirror
                // (if any) always comes down (§3 Lifecycles).
                let namespace = remote.metadata.namespace.clone().unwrap_or_default();
                let name = remote.metadata.name.clone().unwrap_or_default();
                let mirror_name = crate::naming::mirror_name(&name, &self.deps.link.target_cluster_name);
                service::handle_deleted(
                    self.deps.local,
                    &self.deps.link.target_cluster_name,
                    self.deps.enable_headless,
                    &namespace,
                    &mirror_name,
                )
                .await
            }
            DomainEvent::RemoteServiceCreated(remote) => {
                let remote_namespace = remote.metadata.namespace.clone().unwrap_or_default();
                let remote_name = remote.metadata.name.clone().unwrap_or_default();
                let remote_endpoints = self.remote.get_endpoints(&remote_namespace, &remote_name).await?;
                service::handle_created(&self.deps, remote, remote_endpoints).await
            }
            DomainEvent::RemoteServiceUpdated { mirror, endpoints, remote } => {
                service::handle_updated(&self.deps, *mirror, *endpoints, *remote).await
            }
            DomainEvent::RemoteServiceDeleted { namespace, name } => {
                service::handle_deleted(
                    self.deps.local,
                    &self.deps.link.target_cluster_name,
                    self.deps.enable_headless,
                    &namespace,
                    &name,
                )
                .await
            }
            DomainEvent::OnAddEndpointsCalled(endpoints) | DomainEvent::OnUpdateEndpointsCalled(endpoints) => {
                headless::handle_endpoints(&self.deps, self.remote, endpoints).await
            }
            DomainEvent::OrphanedServicesGcTriggered => {
                repair::cleanup_orphaned_services(self.deps.local, self.remote, self.deps.link).await
            }
            DomainEvent::ClusterUnregistered => {
                repair::cleanup_mirrored_resources(self.deps.local, self.deps.link).await
            }
            DomainEvent::RepairEndpoints => {
                repair::repair_endpoints(
                    self.deps.local,
                    self.deps.resolver,
                    self.metrics,
                    &self.controller_namespace,
                    self.deps.link,
                )
                .await
            }
        }
    }
}
