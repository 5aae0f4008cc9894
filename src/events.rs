//! Domain events: the sum type the [Event Translator](crate::translator) produces
//! from raw watch callbacks and the [Reconciler](crate::reconciler) dispatches
//! on. Replaces the "three concrete callback hooks plus a handful of
//! self-triggered signals" shape of the source with a single tagged enum --
//! no open-ended dispatch required.

use k8s_openapi::api::core::v1::{Endpoints, Service};

#[derive(Debug, Clone)]
pub enum DomainEvent {
    OnAddCalled(Service),
    OnUpdateCalled(Service),
    OnDeleteCalled(Service),
    OnAddEndpointsCalled(Endpoints),
    OnUpdateEndpointsCalled(Endpoints),

    /// Raised by `createOrUpdateService` once it has decided the remote service
    /// needs a brand-new local mirror.
    RemoteServiceCreated(Service),
    /// Raised once `createOrUpdateService` has fetched the existing mirror and
    /// its endpoints and confirmed the remote's `resourceVersion` has moved on.
    RemoteServiceUpdated {
        mirror: Box<Service>,
        endpoints: Box<Endpoints>,
        remote: Box<Service>,
    },
    /// Raised when the remote service disappeared, or stopped matching the
    /// selector, and a local mirror must be torn down.
    RemoteServiceDeleted { namespace: String, name: String },

    OrphanedServicesGcTriggered,
    RepairEndpoints,
    ClusterUnregistered,
}

impl DomainEvent {
    /// The key two events coalesce on when one is still in flight (§4.2 /
    /// §5 "the queue... coalesce[s] duplicate keys"). Self-triggered singleton
    /// events (GC, repair, unregister) share one key each so that, for example,
    /// a repair tick that fires while the previous one is still being worked
    /// collapses into a single pending tick rather than queueing unboundedly.
    pub fn queue_key(&self) -> String {
        match self {
            Self::OnAddCalled(svc) | Self::OnUpdateCalled(svc) | Self::OnDeleteCalled(svc) => {
                object_key(
                    "service",
                    svc.metadata.namespace.as_deref(),
                    svc.metadata.name.as_deref(),
                )
            }
            Self::OnAddEndpointsCalled(ep) | Self::OnUpdateEndpointsCalled(ep) => object_key(
                "endpoints",
                ep.metadata.namespace.as_deref(),
                ep.metadata.name.as_deref(),
            ),
            Self::RemoteServiceCreated(svc) => object_key(
                "create",
                svc.metadata.namespace.as_deref(),
                svc.metadata.name.as_deref(),
            ),
            Self::RemoteServiceUpdated { remote, .. } => object_key(
                "update",
                remote.metadata.namespace.as_deref(),
                remote.metadata.name.as_deref(),
            ),
            Self::RemoteServiceDeleted { namespace, name } => {
                object_key("delete", Some(namespace), Some(name))
            }
            Self::OrphanedServicesGcTriggered => "gc".to_string(),
            Self::RepairEndpoints => "repair".to_string(),
            Self::ClusterUnregistered => "unregistered".to_string(),
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::OnAddCalled(_) => "OnAddCalled",
            Self::OnUpdateCalled(_) => "OnUpdateCalled",
            Self::OnDeleteCalled(_) => "OnDeleteCalled",
            Self::OnAddEndpointsCalled(_) => "OnAddEndpointsCalled",
            Self::OnUpdateEndpointsCalled(_) => "OnUpdateEndpointsCalled",
            Self::RemoteServiceCreated(_) => "RemoteServiceCreated",
            Self::RemoteServiceUpdated { .. } => "RemoteServiceUpdated",
            Self::RemoteServiceDeleted { .. } => "RemoteServiceDeleted",
            Self::OrphanedServicesGcTriggered => "OrphanedServicesGcTriggered",
            Self::RepairEndpoints => "RepairEndpoints",
            Self::ClusterUnregistered => "ClusterUnregistered",
        }
    }
}

fn object_key(kind: &str, namespace: Option<&str>, name: Option<&str>) -> String {
    format!(
        "{kind}/{}/{}",
        namespace.unwrap_or_default(),
        name.unwrap_or_default()
    )
}

/// A raw delete callback payload, modeling the tombstone-recovery case a
/// shared informer surfaces when a delete is observed for an object already
/// evicted from its local cache (§4.1, §9 "tombstone recovery ... a first-class
/// case in the delete handler").
pub enum RawDelete<T> {
    Live(T),
    Tombstone { last_known: Option<T> },
}

impl<T> RawDelete<T> {
    /// Recovers the last known object, logging and dropping the event on
    /// failure rather than propagating an error -- a lost delete self-heals on
    /// the next orphan GC pass.
    pub fn recover(self) -> Option<T> {
        match self {
            Self::Live(obj) => Some(obj),
            Self::Tombstone {
                last_known: Some(obj),
            } => Some(obj),
            Self::Tombstone { last_known: None } => {
                tracing::warn!("dropping delete event: tombstone carried no recoverable object");
                None
            }
        }
    }
}
