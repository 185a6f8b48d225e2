//! Read/write access to the cluster's resource records.

use std::fmt::Debug;

use async_trait::async_trait;
use cosi_crds::v1alpha1::{Bucket, BucketAccess, BucketAccessClass, BucketClaim, BucketClass};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Attempts of a read-modify-write before a conflict is returned.
const CONFLICT_RETRIES: usize = 5;

/// A record kind the controller reads or writes.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// `namespace` is ignored for cluster scoped kinds. `None` addresses
    /// every namespace of a namespaced kind.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_object {
    ($($kind:ty),*) => {
        $(impl Object for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }
        })*
    };
}

macro_rules! cluster_object {
    ($($kind:ty),*) => {
        $(impl Object for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        })*
    };
}

namespaced_object!(BucketClaim, BucketAccess, Secret);
cluster_object!(Bucket, BucketClass, BucketAccessClass);

/// Versioned record store with optimistic concurrency. `replace` and
/// `replace_status` fail with a 409 when the object's resourceVersion is
/// stale.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<Option<K>>;

    async fn list<K: Object>(&self, namespace: Option<&str>) -> kube::Result<Vec<K>>;

    async fn create<K: Object>(&self, obj: &K) -> kube::Result<K>;

    async fn replace<K: Object>(&self, obj: &K) -> kube::Result<K>;

    async fn replace_status<K: Object>(&self, obj: &K) -> kube::Result<K>;

    /// Deleting an object that still carries finalizers only marks it
    /// for deletion.
    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<()>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for<K: Object>(&self, obj: &K) -> Api<K> {
        K::api(self.client.clone(), obj.meta().namespace.as_deref())
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<Option<K>> {
        K::api(self.client.clone(), namespace).get_opt(name).await
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> kube::Result<Vec<K>> {
        Ok(K::api(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create<K: Object>(&self, obj: &K) -> kube::Result<K> {
        self.api_for(obj).create(&PostParams::default(), obj).await
    }

    async fn replace<K: Object>(&self, obj: &K) -> kube::Result<K> {
        self.api_for(obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
    }

    async fn replace_status<K: Object>(&self, obj: &K) -> kube::Result<K> {
        let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        self.api_for(obj)
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<()> {
        K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(r) if r.code == 404)
}

pub fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(r) if r.code == 409 && r.reason == "AlreadyExists")
}

pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(r) if r.code == 409 && r.reason != "AlreadyExists")
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == finalizer))
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Fetches the latest `name`, applies `mutate` and writes it back,
/// re-reading on conflicts. `mutate` returns false when nothing changed,
/// which skips the write. Returns `None` when the object does not exist.
pub async fn modify<S, K, F>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    mutate: F,
) -> kube::Result<Option<K>>
where
    S: ResourceStore + ?Sized,
    K: Object,
    F: FnMut(&mut K) -> bool + Send,
{
    read_modify_write(store, namespace, name, mutate, false).await
}

/// [`modify`] against the status subresource.
pub async fn modify_status<S, K, F>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    mutate: F,
) -> kube::Result<Option<K>>
where
    S: ResourceStore + ?Sized,
    K: Object,
    F: FnMut(&mut K) -> bool + Send,
{
    read_modify_write(store, namespace, name, mutate, true).await
}

async fn read_modify_write<S, K, F>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    mut mutate: F,
    status: bool,
) -> kube::Result<Option<K>>
where
    S: ResourceStore + ?Sized,
    K: Object,
    F: FnMut(&mut K) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut obj) = store.get::<K>(namespace, name).await? else {
            return Ok(None);
        };
        if !mutate(&mut obj) {
            return Ok(Some(obj));
        }
        let written = if status {
            store.replace_status(&obj).await
        } else {
            store.replace(&obj).await
        };
        match written {
            Ok(obj) => return Ok(Some(obj)),
            Err(e) if is_conflict(&e) && attempt < CONFLICT_RETRIES => {
                debug!(kind = %K::kind(&()), name, attempt, "conflict writing object, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn add_finalizer<S, K>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    finalizer: &str,
) -> kube::Result<Option<K>>
where
    S: ResourceStore + ?Sized,
    K: Object,
{
    modify(store, namespace, name, |obj: &mut K| {
        if has_finalizer(obj, finalizer) {
            return false;
        }
        obj.finalizers_mut().push(finalizer.to_string());
        true
    })
    .await
}

pub async fn remove_finalizer<S, K>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
    finalizer: &str,
) -> kube::Result<Option<K>>
where
    S: ResourceStore + ?Sized,
    K: Object,
{
    modify(store, namespace, name, |obj: &mut K| {
        if !has_finalizer(obj, finalizer) {
            return false;
        }
        obj.finalizers_mut().retain(|f| f != finalizer);
        true
    })
    .await
}

/// Deletes `name`, treating an already missing object as deleted.
pub async fn delete_if_exists<S, K>(
    store: &S,
    namespace: Option<&str>,
    name: &str,
) -> kube::Result<()>
where
    S: ResourceStore + ?Sized,
    K: Object,
{
    match store.delete::<K>(namespace, name).await {
        Err(e) if is_not_found(&e) => Ok(()),
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use cosi_crds::v1alpha1::BucketSpec;

    use super::*;
    use crate::testing::{MemoryStore, api_error};

    #[test]
    fn test_error_classification() {
        let conflict = api_error(409, "Conflict");
        let exists = api_error(409, "AlreadyExists");
        let missing = api_error(404, "NotFound");
        assert!(is_conflict(&conflict) && !is_already_exists(&conflict));
        assert!(is_already_exists(&exists) && !is_conflict(&exists));
        assert!(is_not_found(&missing));
    }

    #[tokio::test]
    async fn test_finalizers_are_added_once() {
        let store = MemoryStore::default();
        store
            .create(&Bucket::new("b1", BucketSpec::default()))
            .await
            .unwrap();

        for _ in 0..2 {
            add_finalizer::<_, Bucket>(&store, None, "b1", "example.com/a")
                .await
                .unwrap();
        }
        let bucket: Bucket = store.get(None, "b1").await.unwrap().unwrap();
        assert_eq!(bucket.finalizers(), ["example.com/a"]);

        remove_finalizer::<_, Bucket>(&store, None, "b1", "example.com/a")
            .await
            .unwrap();
        let bucket: Bucket = store.get(None, "b1").await.unwrap().unwrap();
        assert!(bucket.finalizers().is_empty());
    }

    #[tokio::test]
    async fn test_modify_missing_object() {
        let store = MemoryStore::default();
        let res = add_finalizer::<_, Bucket>(&store, None, "missing", "example.com/a")
            .await
            .unwrap();
        assert!(res.is_none());
        delete_if_exists::<_, Bucket>(&store, None, "missing")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_modify_retries_conflicts() {
        let store = MemoryStore::default();
        store
            .create(&Bucket::new("b1", BucketSpec::default()))
            .await
            .unwrap();
        store.fail_next_writes(2);

        let bucket = add_finalizer::<_, Bucket>(&store, None, "b1", "example.com/a")
            .await
            .unwrap()
            .unwrap();
        assert!(has_finalizer(&bucket, "example.com/a"));
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizers() {
        let store = MemoryStore::default();
        store
            .create(&Bucket::new("b1", BucketSpec::default()))
            .await
            .unwrap();
        add_finalizer::<_, Bucket>(&store, None, "b1", "example.com/a")
            .await
            .unwrap();

        store.delete::<Bucket>(None, "b1").await.unwrap();
        let bucket: Bucket = store.get(None, "b1").await.unwrap().unwrap();
        assert!(is_deleting(&bucket));

        remove_finalizer::<_, Bucket>(&store, None, "b1", "example.com/a")
            .await
            .unwrap();
        assert!(store.get::<Bucket>(None, "b1").await.unwrap().is_none());
    }
}
