use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::{api::PostParams, Api, Client};
use serde::de::DeserializeOwned;

use super::{BuildCluster, BuildResource, ResourceKind};
use crate::error::{Error, Result};

/// `BuildCluster` backed by a live API server.
#[derive(Clone)]
pub struct KubeBuildCluster { client: Client }

impl KubeBuildCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    fn namespaced<K>(&self, namespace: Option<&str>, kind: ResourceKind) -> Result<Api<K>>
    where K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>, <K as kube::Resource>::DynamicType: Default {
        let ns = namespace.ok_or_else(|| Error::config(format!("{} requires a namespace", kind.as_str())))?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }
}

async fn get_exists<K>(api: Api<K>, kind: ResourceKind, name: &str) -> Result<bool>
where K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug {
    api.get_opt(name).await.map(|o| o.is_some()).map_err(|e| Error::cluster("get", kind.as_str(), name, e))
}

async fn post<K>(api: Api<K>, kind: ResourceKind, obj: &K, name: &str) -> Result<()>
where K: kube::Resource + Clone + DeserializeOwned + serde::Serialize + std::fmt::Debug {
    api.create(&PostParams::default(), obj).await.map(|_| ()).map_err(|e| Error::cluster("create", kind.as_str(), name, e))
}

#[async_trait]
impl BuildCluster for KubeBuildCluster {
    async fn exists(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<bool> {
        match kind {
            ResourceKind::Namespace => get_exists(Api::<Namespace>::all(self.client.clone()), kind, name).await,
            ResourceKind::Secret => get_exists(self.namespaced::<Secret>(namespace, kind)?, kind, name).await,
            ResourceKind::ConfigMap => get_exists(self.namespaced::<ConfigMap>(namespace, kind)?, kind, name).await,
            ResourceKind::Job => get_exists(self.namespaced::<Job>(namespace, kind)?, kind, name).await,
        }
    }

    async fn create(&self, resource: &BuildResource) -> Result<()> {
        let (kind, ns, name) = (resource.kind(), resource.namespace(), resource.name());
        match resource {
            BuildResource::Namespace(o) => post(Api::<Namespace>::all(self.client.clone()), kind, o, name).await,
            BuildResource::Secret(o) => post(self.namespaced::<Secret>(ns, kind)?, kind, o, name).await,
            BuildResource::ConfigMap(o) => post(self.namespaced::<ConfigMap>(ns, kind)?, kind, o, name).await,
            BuildResource::Job(o) => post(self.namespaced::<Job>(ns, kind)?, kind, o, name).await,
        }
    }
}
