//! Thin local/remote cluster access, behind traits so the translator and
//! mutators can be exercised against an in-memory fake instead of a live API
//! server (§8: "async tests against fake/in-memory listers"). The production
//! implementation is a direct `kube::Api` wrapper -- the controller is the
//! local cluster's sole writer for mirror-labelled objects, so there's no
//! need for a local watch cache on top of it. The remote side additionally
//! needs a watch cache; that's built in [`crate::watcher`] on top of
//! `RemoteCluster::get_*` plus `kube::runtime::reflector`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service};
use kube::{
    api::{ListParams, PostParams},
    Api, Client,
};

use crate::error::{is_already_exists, is_not_found, Error};

#[async_trait]
pub trait LocalCluster: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;
    async fn create_service(&self, service: Service) -> Result<Service, Error>;
    async fn update_service(&self, service: Service) -> Result<Service, Error>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error>;
    /// Cluster-wide equivalent of [`LocalCluster::list_services`]: mirrors live
    /// in whatever namespace their remote counterpart came from, so orphan GC
    /// and repair (§4.7) can't scope to a single namespace.
    async fn list_services_all_namespaces(&self, selector: &str) -> Result<Vec<Service>, Error>;

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error>;
    async fn create_endpoints(&self, endpoints: Endpoints) -> Result<Endpoints, Error>;
    async fn update_endpoints(&self, endpoints: Endpoints) -> Result<Endpoints, Error>;
    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), Error>;
    async fn list_endpoints(&self, namespace: &str, selector: &str) -> Result<Vec<Endpoints>, Error>;
    async fn list_endpoints_all_namespaces(&self, selector: &str) -> Result<Vec<Endpoints>, Error>;

    /// Creates the namespace, mirror-labelled, if it doesn't already exist.
    async fn ensure_namespace(
        &self,
        namespace: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

#[async_trait]
pub trait RemoteCluster: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error>;
}

/// Direct `kube::Api` backed implementation of both traits; `KubeCluster` is
/// constructed once per cluster (local or remote) from that cluster's
/// `kube::Client`.
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LocalCluster for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_service(&self, service: Service) -> Result<Service, Error> {
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let name = service.metadata.name.clone().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), &service).await {
            Ok(created) => Ok(created),
            Err(err) if is_already_exists(&err) => Ok(api.get(&name).await?),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_service(&self, service: Service) -> Result<Service, Error> {
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let name = service.metadata.name.clone().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&name, &PostParams::default(), &service).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn list_services_all_namespaces(&self, selector: &str) -> Result<Vec<Service>, Error> {
        let api: Api<Service> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ep) => Ok(Some(ep)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_endpoints(&self, endpoints: Endpoints) -> Result<Endpoints, Error> {
        let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), &endpoints).await {
            Ok(created) => Ok(created),
            Err(err) if is_already_exists(&err) => Ok(api.get(&name).await?),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_endpoints(&self, endpoints: Endpoints) -> Result<Endpoints, Error> {
        let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&name, &PostParams::default(), &endpoints).await?)
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_endpoints(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn list_endpoints_all_namespaces(&self, selector: &str) -> Result<Vec<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn ensure_namespace(
        &self,
        namespace: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(namespace).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                let ns = Namespace {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some(namespace.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                api.create(&PostParams::default(), &ns).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl RemoteCluster for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ep) => Ok(Some(ep)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory stand-ins for both traits, shared by every module's unit tests
/// (cfg(test) is crate-wide during `cargo test`, so `crate::cluster::fake` is
/// reachable from any other module's test submodule).
#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use kube::ResourceExt;

    use super::*;
    use crate::selector::Selector;

    #[derive(Default)]
    pub struct FakeCluster {
        pub services: Mutex<BTreeMap<(String, String), Service>>,
        pub endpoints: Mutex<BTreeMap<(String, String), Endpoints>>,
        pub namespaces: Mutex<std::collections::BTreeSet<String>>,
    }

    impl FakeCluster {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_service(&self, svc: Service) {
            let key = (
                svc.metadata.namespace.clone().unwrap_or_default(),
                svc.metadata.name.clone().unwrap_or_default(),
            );
            self.services.lock().unwrap().insert(key, svc);
        }

        pub fn seed_endpoints(&self, ep: Endpoints) {
            let key = (
                ep.metadata.namespace.clone().unwrap_or_default(),
                ep.metadata.name.clone().unwrap_or_default(),
            );
            self.endpoints.lock().unwrap().insert(key, ep);
        }
    }

    #[async_trait]
    impl LocalCluster for FakeCluster {
        async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
            Ok(self
                .services
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create_service(&self, mut service: Service) -> Result<Service, Error> {
            service.meta_mut().resource_version = Some("1".to_string());
            if service.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()) != Some("None") {
                if let Some(spec) = service.spec.as_mut() {
                    spec.cluster_ip = Some(format!("10.99.{}.1", self.services.lock().unwrap().len()));
                }
            }
            self.seed_service(service.clone());
            Ok(service)
        }

        async fn update_service(&self, mut service: Service) -> Result<Service, Error> {
            let key = (
                service.metadata.namespace.clone().unwrap_or_default(),
                service.metadata.name.clone().unwrap_or_default(),
            );
            let next_rv = self
                .services
                .lock()
                .unwrap()
                .get(&key)
                .and_then(|existing| existing.metadata.resource_version.clone())
                .and_then(|rv| rv.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            service.meta_mut().resource_version = Some(next_rv.to_string());
            self.seed_service(service.clone());
            Ok(service)
        }

        async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
            self.services
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
            Ok(())
        }

        async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error> {
            let selector = Selector::parse(selector).map_err(Error::terminal)?;
            Ok(self
                .services
                .lock()
                .unwrap()
                .values()
                .filter(|svc| svc.metadata.namespace.as_deref() == Some(namespace))
                .filter(|svc| {
                    selector.matches(svc.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()))
                })
                .cloned()
                .collect())
        }

        async fn list_services_all_namespaces(&self, selector: &str) -> Result<Vec<Service>, Error> {
            let selector = Selector::parse(selector).map_err(Error::terminal)?;
            Ok(self
                .services
                .lock()
                .unwrap()
                .values()
                .filter(|svc| {
                    selector.matches(svc.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()))
                })
                .cloned()
                .collect())
        }

        async fn get_endpoints(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Endpoints>, Error> {
            Ok(self
                .endpoints
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create_endpoints(&self, endpoints: Endpoints) -> Result<Endpoints, Error> {
            self.seed_endpoints(endpoints.clone());
            Ok(endpoints)
        }

        async fn update_endpoints(&self, endpoints: Endpoints) -> Result<Endpoints, Error> {
            self.seed_endpoints(endpoints.clone());
            Ok(endpoints)
        }

        async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), Error> {
            self.endpoints
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
            Ok(())
        }

        async fn list_endpoints(
            &self,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<Endpoints>, Error> {
            let selector = Selector::parse(selector).map_err(Error::terminal)?;
            Ok(self
                .endpoints
                .lock()
                .unwrap()
                .values()
                .filter(|ep| ep.metadata.namespace.as_deref() == Some(namespace))
                .filter(|ep| selector.matches(ep.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
                .cloned()
                .collect())
        }

        async fn list_endpoints_all_namespaces(
            &self,
            selector: &str,
        ) -> Result<Vec<Endpoints>, Error> {
            let selector = Selector::parse(selector).map_err(Error::terminal)?;
            Ok(self
                .endpoints
                .lock()
                .unwrap()
                .values()
                .filter(|ep| selector.matches(ep.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
                .cloned()
                .collect())
        }

        async fn ensure_namespace(
            &self,
            namespace: &str,
            _labels: BTreeMap<String, String>,
        ) -> Result<(), Error> {
            self.namespaces.lock().unwrap().insert(namespace.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteCluster for FakeCluster {
        async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
            LocalCluster::get_service(self, namespace, name).await
        }

        async fn get_endpoints(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Endpoints>, Error> {
            LocalCluster::get_endpoints(self, namespace, name).await
        }
    }
}
