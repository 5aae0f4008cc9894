//! Posts human-readable cluster events the way a client-go `EventRecorder`
//! does (§4.9 ambient expansion). The only event this core ever raises is
//! `ServiceMirroringSkipped`, fired against the *remote* service when a
//! headless remote has no ports to mirror.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{
    runtime::events::{Event, EventType, Recorder as EventsRecorder, Reporter},
    Client, ResourceExt,
};

use crate::labels::SERVICE_MIRRORING_SKIPPED_REASON;

/// Split out as a trait so mutator tests can assert on recorded events
/// without touching the network (mirrors [`crate::resolver::Resolve`]).
#[async_trait]
pub trait Record: Send + Sync {
    async fn service_mirroring_skipped(&self, remote: &Service, message: &str);
}

pub struct Recorder {
    client: Client,
    reporter: Reporter,
}

impl Recorder {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl Record for Recorder {
    /// Posts `ServiceMirroringSkipped` against `remote`. Failures are logged
    /// at `warn` and swallowed -- a recorder failure must never fail a
    /// reconcile (§4.9).
    async fn service_mirroring_skipped(&self, remote: &Service, message: &str) {
        let namespace = remote.metadata.namespace.clone().unwrap_or_default();
        let obj_ref = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Service".to_string()),
            name: remote.metadata.name.clone(),
            namespace: Some(namespace.clone()),
            uid: remote.uid(),
            resource_version: remote.resource_version(),
            ..Default::default()
        };

        let event = Event {
            type_: EventType::Normal,
            reason: SERVICE_MIRRORING_SKIPPED_REASON.to_string(),
            note: Some(message.to_string()),
            action: "MirrorService".to_string(),
            secondary: None,
        };

        let publish = EventsRecorder::new(self.client.clone(), self.reporter.clone(), obj_ref)
            .publish(event)
            .await;
        if let Err(err) = publish {
            tracing::warn!(%err, namespace, "failed to post ServiceMirroringSkipped event");
        }
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeRecorder {
        pub skipped: Mutex<Vec<(String, String)>>,
    }

    impl FakeRecorder {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Record for FakeRecorder {
        async fn service_mirroring_skipped(&self, remote: &Service, message: &str) {
            self.skipped.lock().unwrap().push((
                remote.metadata.name.clone().unwrap_or_default(),
                message.to_string(),
            ));
        }
    }
}
