//! Event Translator (§4.1): turns raw add/update/delete callbacks from the
//! remote watchers into [`DomainEvent`]s, applying the export-selector filter
//! and the headless-endpoints filter before anything reaches the queue.

use k8s_openapi::api::core::v1::Endpoints;

use crate::{events::{DomainEvent, RawDelete}, labels, queue::WorkQueue, selector::Selector};

const KUBE_SYSTEM: &str = "kube-system";

pub struct Translator<'a> {
    queue: &'a WorkQueue,
    selector: &'a Selector,
}

impl<'a> Translator<'a> {
    pub fn new(queue: &'a WorkQueue, selector: &'a Selector) -> Self {
        Self { queue, selector }
    }

    pub fn on_add(&self, svc: k8s_openapi::api::core::v1::Service) {
        self.queue.add(DomainEvent::OnAddCalled(svc));
    }

    pub fn on_update(&self, svc: k8s_openapi::api::core::v1::Service) {
        self.queue.add(DomainEvent::OnUpdateCalled(svc));
    }

    /// Recovers a tombstoned delete, logging and dropping on failure rather
    /// than propagating (§4.1, §9).
    pub fn on_delete(&self, event: RawDelete<k8s_openapi::api::core::v1::Service>) {
        if let Some(svc) = event.recover() {
            self.queue.add(DomainEvent::OnDeleteCalled(svc));
        }
    }

    /// Endpoints add/update only reach the queue when they're (a) not in
    /// `kube-system` and (b) carry both the headless marker and the link's
    /// export-selector label (§4.1 table).
    pub fn on_add_endpoints(&self, endpoints: Endpoints) {
        if self.exported_headless(&endpoints) {
            self.queue.add(DomainEvent::OnAddEndpointsCalled(endpoints));
        }
    }

    pub fn on_update_endpoints(&self, endpoints: Endpoints) {
        if self.exported_headless(&endpoints) {
            self.queue.add(DomainEvent::OnUpdateEndpointsCalled(endpoints));
        }
    }

    pub fn on_delete_endpoints(&self, event: RawDelete<Endpoints>) {
        if let Some(endpoints) = event.recover() {
            if self.exported_headless(&endpoints) {
                // No dedicated domain event: the headless mutator re-derives
                // endpoint-mirror membership from the remote service's
                // endpoints on its next add/update, and orphan GC cleans up
                // anything left stranded.
                tracing::debug!(
                    namespace = endpoints.metadata.namespace.as_deref().unwrap_or_default(),
                    name = endpoints.metadata.name.as_deref().unwrap_or_default(),
                    "exported headless endpoints deleted upstream"
                );
            }
        }
    }

    fn exported_headless(&self, endpoints: &Endpoints) -> bool {
        if endpoints.metadata.namespace.as_deref() == Some(KUBE_SYSTEM) {
            return false;
        }

        let Some(object_labels) = endpoints.metadata.labels.as_ref() else {
            return false;
        };

        object_labels.contains_key(labels::HEADLESS_SVC_LABEL) && self.selector.matches(object_labels)
    }

    pub fn trigger_orphan_gc(&self) {
        self.queue.add(DomainEvent::OrphanedServicesGcTriggered);
    }

    pub fn trigger_repair(&self) {
        self.queue.add(DomainEvent::RepairEndpoints);
    }

    pub fn trigger_cluster_unregistered(&self) {
        self.queue.add(DomainEvent::ClusterUnregistered);
    }
}
