//! In-memory fakes of the store, event and driver seams.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cosi_api::{
    DriverCreateBucketRequest, DriverCreateBucketResponse, DriverDeleteBucketRequest,
    DriverDeleteBucketResponse, DriverGetInfoResponse, DriverGrantBucketAccessRequest,
    DriverGrantBucketAccessResponse, DriverRevokeBucketAccessRequest,
    DriverRevokeBucketAccessResponse,
};
use cosi_crds::v1alpha1::{
    AuthenticationType, Bucket, BucketAccess, BucketAccessClass, BucketAccessClassSpec,
    BucketAccessSpec, BucketClaim, BucketClaimSpec, BucketClass, BucketClassSpec, BucketSpec,
    DeletionPolicy, ProtocolName,
};
use cosi_provisioner::{MemoryDriver, Provisioner};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::ErrorResponse;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tonic::Status;

use crate::Dependencies;
use crate::events::EventPublisher;
use crate::store::{Object, ResourceStore};

pub const DRIVER: &str = "test.objectstorage.k8s.io";
pub const NAMESPACE: &str = "apps";
const DELETION_TIMESTAMP: &str = "2026-01-01T00:00:00Z";

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("{reason} ({code})"),
        reason: reason.into(),
        code,
    })
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
    failing_writes: usize,
}

/// Behaves like the API server for the subset the listeners use:
/// resourceVersion checks, a separate status subresource, and
/// finalizer-gated deletion.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key<K: Object>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).into_owned(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn key_of<K: Object>(obj: &K) -> Key {
    key::<K>(obj.meta().namespace.as_deref(), &obj.name_any())
}

fn to_value<K: Object>(obj: &K) -> kube::Result<Value> {
    serde_json::to_value(obj).map_err(kube::Error::SerdeError)
}

fn from_value<K: Object>(value: Value) -> kube::Result<K> {
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

fn copy_field(to: &mut Value, from: &Value, pointer: &str, field: &str) {
    let source = from.pointer(pointer).and_then(|p| p.get(field)).cloned();
    if let Some(target) = to.pointer_mut(pointer).and_then(Value::as_object_mut) {
        match source {
            Some(v) => {
                target.insert(field.to_string(), v);
            }
            None => {
                target.remove(field);
            }
        }
    }
}

fn resource_version(value: &Value) -> Option<&str> {
    value.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

fn has_finalizers(value: &Value) -> bool {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

impl MemoryStore {
    /// Makes the next `n` writes fail with a conflict.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().failing_writes = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write<K: Object>(&self, obj: &K, status: bool) -> kube::Result<K> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(api_error(409, "Conflict"));
        }
        let key = key_of(obj);
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };
        let incoming = to_value(obj)?;
        if let Some(rv) = resource_version(&incoming)
            && Some(rv) != resource_version(&stored)
        {
            return Err(api_error(409, "Conflict"));
        }

        let mut next = if status {
            let mut next = stored.clone();
            if let Some(target) = next.as_object_mut() {
                match incoming.get("status") {
                    Some(s) => target.insert("status".into(), s.clone()),
                    None => target.remove("status"),
                };
            }
            next
        } else {
            let mut next = incoming;
            if let (Some(target), Some(source)) = (next.as_object_mut(), stored.as_object()) {
                match source.get("status") {
                    Some(s) => target.insert("status".into(), s.clone()),
                    None => target.remove("status"),
                };
            }
            copy_field(&mut next, &stored, "/metadata", "deletionTimestamp");
            copy_field(&mut next, &stored, "/metadata", "uid");
            next
        };

        inner.version += 1;
        next["metadata"]["resourceVersion"] = Value::String(inner.version.to_string());
        let deleting = next.pointer("/metadata/deletionTimestamp").is_some();
        if deleting && !has_finalizers(&next) {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, next.clone());
        }
        from_value(next)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<Option<K>> {
        let value = self.lock().objects.get(&key::<K>(namespace, name)).cloned();
        value.map(from_value).transpose()
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> kube::Result<Vec<K>> {
        let kind = K::kind(&()).into_owned();
        let values: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|n| n == ns.as_str()))
            .map(|(_, v)| v.clone())
            .collect();
        values.into_iter().map(from_value).collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> kube::Result<K> {
        let mut inner = self.lock();
        let key = key_of(obj);
        if inner.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        inner.version += 1;
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.resource_version = Some(inner.version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", inner.version));
        }
        inner.objects.insert(key, to_value(&obj)?);
        Ok(obj)
    }

    async fn replace<K: Object>(&self, obj: &K) -> kube::Result<K> {
        self.write(obj, false)
    }

    async fn replace_status<K: Object>(&self, obj: &K) -> kube::Result<K> {
        self.write(obj, true)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> kube::Result<()> {
        let mut inner = self.lock();
        let key = key::<K>(namespace, name);
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };
        if !has_finalizers(&stored) {
            inner.objects.remove(&key);
            return Ok(());
        }
        inner.version += 1;
        let version = inner.version.to_string();
        if let Some(value) = inner.objects.get_mut(&key) {
            if value.pointer("/metadata/deletionTimestamp").is_none() {
                value["metadata"]["deletionTimestamp"] = Value::String(DELETION_TIMESTAMP.into());
            }
            value["metadata"]["resourceVersion"] = Value::String(version);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub name: Option<String>,
    pub type_: EventType,
    pub reason: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.recorded().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                name: resource_ref.name.clone(),
                type_,
                reason: reason.to_string(),
            });
    }
}

mockall::mock! {
    pub Driver {}

    #[async_trait]
    impl Provisioner for Driver {
        async fn driver_get_info(&self) -> Result<DriverGetInfoResponse, Status>;

        async fn driver_create_bucket(
            &self,
            req: DriverCreateBucketRequest,
        ) -> Result<DriverCreateBucketResponse, Status>;

        async fn driver_delete_bucket(
            &self,
            req: DriverDeleteBucketRequest,
        ) -> Result<DriverDeleteBucketResponse, Status>;

        async fn driver_grant_bucket_access(
            &self,
            req: DriverGrantBucketAccessRequest,
        ) -> Result<DriverGrantBucketAccessResponse, Status>;

        async fn driver_revoke_bucket_access(
            &self,
            req: DriverRevokeBucketAccessRequest,
        ) -> Result<DriverRevokeBucketAccessResponse, Status>;
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingEvents>,
    pub deps: Dependencies<MemoryStore>,
}

impl Harness {
    pub fn new(provisioner: impl Provisioner) -> Self {
        let store = Arc::new(MemoryStore::default());
        let events = Arc::new(RecordingEvents::default());
        let deps = Dependencies::new(store.clone(), Arc::new(provisioner), events.clone(), DRIVER);
        Self {
            store,
            events,
            deps,
        }
    }

    pub fn with_memory_driver() -> (Self, MemoryDriver) {
        let driver = MemoryDriver::new(DRIVER);
        (Self::new(driver.clone()), driver)
    }

    pub async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.store.get(namespace, name).await.unwrap()
    }

    pub async fn seed<K: Object>(&self, obj: K) -> Arc<K> {
        Arc::new(self.store.create(&obj).await.unwrap())
    }
}

pub fn bucket_class(name: &str, policy: DeletionPolicy) -> BucketClass {
    let mut class = BucketClass::new(
        name,
        BucketClassSpec {
            driver_name: DRIVER.into(),
            deletion_policy: policy,
            parameters: BTreeMap::from([("tier".to_string(), "standard".to_string())]),
        },
    );
    class.metadata.uid = Some(format!("uid-class-{name}"));
    class
}

pub fn access_class(name: &str, auth: AuthenticationType) -> BucketAccessClass {
    BucketAccessClass::new(
        name,
        BucketAccessClassSpec {
            driver_name: DRIVER.into(),
            authentication_type: auth,
            parameters: BTreeMap::new(),
        },
    )
}

pub fn bucket(name: &str, class: &str, policy: DeletionPolicy) -> Bucket {
    Bucket::new(
        name,
        BucketSpec {
            driver_name: DRIVER.into(),
            bucket_class_name: class.into(),
            deletion_policy: policy,
            ..Default::default()
        },
    )
}

pub fn claim(name: &str, class: &str) -> BucketClaim {
    let mut claim = BucketClaim::new(
        name,
        BucketClaimSpec {
            bucket_class_name: class.into(),
            ..Default::default()
        },
    );
    claim.metadata.namespace = Some(NAMESPACE.into());
    claim
}

pub fn access(name: &str, claim: &str, class: &str, secret: &str) -> BucketAccess {
    let mut access = BucketAccess::new(
        name,
        BucketAccessSpec {
            bucket_claim_name: claim.into(),
            bucket_access_class_name: class.into(),
            credentials_secret_name: secret.into(),
            service_account_name: None,
            protocol: Some(ProtocolName::S3),
        },
    );
    access.metadata.namespace = Some(NAMESPACE.into());
    access
}
