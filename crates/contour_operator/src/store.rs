//! The object store the ensure engine talks to.
//!
//! Production code uses [`KubeStore`], a thin layer over `kube::Client`. The
//! engine only depends on [`ObjectStore`], so tests can swap in an in-memory
//! store that records every call.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, GetParams, ListParams, ObjectList, PostParams, Request},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

/// Any typed Kubernetes object the operator can read and write.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Get/create/update/delete/list over any [`Object`].
///
/// `namespace` is `None` for cluster-scoped kinds (and for listing across all
/// namespaces). Updates carry the resource version of the submitted object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K, kube::Error>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K, kube::Error>;

    async fn update<K: Object>(&self, obj: &K) -> Result<K, kube::Error>;

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), kube::Error>;

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, kube::Error>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    fn request<K: Object>(namespace: Option<&str>) -> Request {
        Request::new(K::url_path(&(), namespace))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K, kube::Error> {
        let req = Self::request::<K>(namespace)
            .get(name, &GetParams::default())
            .map_err(kube::Error::BuildRequest)?;
        self.client.request::<K>(req).await
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, kube::Error> {
        let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        let req = Self::request::<K>(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), data)
            .map_err(kube::Error::BuildRequest)?;
        self.client.request::<K>(req).await
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K, kube::Error> {
        let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        let req = Self::request::<K>(obj.meta().namespace.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), data)
            .map_err(kube::Error::BuildRequest)?;
        self.client.request::<K>(req).await
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), kube::Error> {
        let req = Self::request::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .map_err(kube::Error::BuildRequest)?;
        // The API answers with either the terminating object or a Status.
        self.client.request::<serde_json::Value>(req).await?;
        Ok(())
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, kube::Error> {
        let req = Self::request::<K>(namespace)
            .list(&ListParams::default())
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<ObjectList<K>>(req).await?.items)
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists")
}

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}
