use std::sync::Arc;

use async_trait::async_trait;
use cosi_api::{DriverCreateBucketRequest, DriverDeleteBucketRequest};
use cosi_crds::finalizers;
use cosi_crds::v1alpha1::{Bucket, BucketAccess, BucketClaim, BucketClass, DeletionPolicy};
use cosi_reconcile::Listener;
use kube::ResourceExt;
use tonic::Code;
use tracing::{debug, info, warn};

use super::to_hash_map;
use crate::events::{actions, reasons};
use crate::store::{
    ResourceStore, delete_if_exists, has_finalizer, is_deleting, modify, modify_status,
    remove_finalizer,
};
use crate::{Dependencies, Error, Result};

/// Provisions backend buckets for Bucket objects and tears them down once
/// the Bucket is deleted.
pub struct BucketListener<S> {
    deps: Dependencies<S>,
}

impl<S: ResourceStore> BucketListener<S> {
    pub fn new(deps: Dependencies<S>) -> Self {
        Self { deps }
    }

    async fn provision(&self, bucket: &Bucket) -> Result<()> {
        let name = bucket.name_any();
        let store = self.deps.store.as_ref();

        let bucket_id = match bucket
            .spec
            .existing_bucket_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            Some(existing) => {
                if bucket.spec.parameters.is_empty() {
                    self.import_class_parameters(bucket).await?;
                }
                info!(bucket = %name, bucket_id = existing, "adopting existing bucket");
                existing.to_string()
            }
            None => self.create_backend_bucket(bucket).await?,
        };

        modify(store, None, &name, |b: &mut Bucket| {
            if has_finalizer(b, finalizers::BUCKET) {
                return false;
            }
            b.finalizers_mut().push(finalizers::BUCKET.to_string());
            true
        })
        .await?;
        modify_status(store, None, &name, |b: &mut Bucket| {
            let status = b.status.get_or_insert_default();
            status.bucket_ready = true;
            status.bucket_id = Some(bucket_id.clone());
            status.message = None;
            true
        })
        .await?;

        if let Some(claim_ref) = &bucket.spec.bucket_claim {
            let updated = modify_status(
                store,
                Some(&claim_ref.namespace),
                &claim_ref.name,
                |c: &mut BucketClaim| {
                    let status = c.status.get_or_insert_default();
                    let changed = !status.bucket_ready || status.bucket_name.is_none();
                    status.bucket_ready = true;
                    status.bucket_name.get_or_insert_with(|| name.clone());
                    changed
                },
            )
            .await?;
            if updated.is_none() {
                warn!(bucket = %name, claim = %claim_ref.name, "bucket claim not found");
            }
        }

        info!(bucket = %name, bucket_id = %bucket_id, "bucket provisioned");
        Ok(())
    }

    async fn import_class_parameters(&self, bucket: &Bucket) -> Result<()> {
        let class_name = &bucket.spec.bucket_class_name;
        let Some(class) = self
            .deps
            .store
            .get::<BucketClass>(None, class_name)
            .await?
        else {
            return Err(Error::ClassNotFound {
                kind: "BucketClass",
                name: class_name.clone(),
            });
        };
        if class.spec.parameters.is_empty() {
            return Ok(());
        }
        modify(
            self.deps.store.as_ref(),
            None,
            &bucket.name_any(),
            |b: &mut Bucket| {
                if !b.spec.parameters.is_empty() {
                    return false;
                }
                b.spec.parameters = class.spec.parameters.clone();
                true
            },
        )
        .await?;
        Ok(())
    }

    async fn create_backend_bucket(&self, bucket: &Bucket) -> Result<String> {
        let name = bucket.name_any();
        let req = DriverCreateBucketRequest {
            name: name.clone(),
            parameters: to_hash_map(&bucket.spec.parameters),
        };
        let bucket_id = match self.deps.provisioner.driver_create_bucket(req).await {
            Ok(rsp) => rsp.bucket_id,
            Err(status) if status.code() == Code::AlreadyExists => {
                debug!(bucket = %name, "bucket already exists in the backend");
                name.clone()
            }
            Err(status) => {
                let err = Error::Rpc(status);
                self.record_failure(bucket, reasons::PROVISIONING_FAILED, actions::PROVISION, &err)
                    .await;
                return Err(err);
            }
        };
        if bucket_id.is_empty() {
            let err = Error::EmptyBucketId(name);
            self.record_failure(bucket, reasons::PROVISIONING_FAILED, actions::PROVISION, &err)
                .await;
            return Err(err);
        }
        Ok(bucket_id)
    }

    /// Releases everything the Bucket holds, in order: dependent
    /// BucketAccesses, the backend bucket, the claim, and finally the
    /// Bucket's own finalizer.
    async fn finalize(&self, bucket: &Bucket) -> Result<()> {
        let name = bucket.name_any();
        let store = self.deps.store.as_ref();

        // Accesses still being granted carry no finalizer on the Bucket yet,
        // so the claim's accesses are always checked.
        let remaining = self.release_accesses(bucket).await?;
        if remaining > 0 && bucket.spec.deletion_policy != DeletionPolicy::Force {
            return Err(Error::WaitingForBucketAccesses {
                bucket: name,
                count: remaining,
            });
        }
        if has_finalizer(bucket, finalizers::BUCKET_ACCESS_BUCKET) {
            remove_finalizer::<_, Bucket>(store, None, &name, finalizers::BUCKET_ACCESS_BUCKET)
                .await?;
        }

        if has_finalizer(bucket, finalizers::BUCKET) {
            if bucket.spec.deletion_policy.deletes_backend() {
                self.delete_backend_bucket(bucket).await?;
            }
            self.release_claim(bucket).await?;
            remove_finalizer::<_, Bucket>(store, None, &name, finalizers::BUCKET).await?;
        }

        info!(bucket = %name, policy = ?bucket.spec.deletion_policy, "bucket finalized");
        Ok(())
    }

    /// Deletes the BucketAccesses of the claim this Bucket was created for.
    /// Returns how many of them still exist.
    async fn release_accesses(&self, bucket: &Bucket) -> Result<usize> {
        let Some(claim_ref) = &bucket.spec.bucket_claim else {
            return Ok(0);
        };
        let store = self.deps.store.as_ref();
        let accesses = store
            .list::<BucketAccess>(Some(&claim_ref.namespace))
            .await?
            .into_iter()
            .filter(|ba| ba.spec.bucket_claim_name == claim_ref.name)
            .collect::<Vec<_>>();
        for access in accesses.iter().filter(|ba| !is_deleting(*ba)) {
            debug!(bucket = %bucket.name_any(), access = %access.name_any(), "deleting dependent bucket access");
            delete_if_exists::<_, BucketAccess>(store, Some(&claim_ref.namespace), &access.name_any())
                .await?;
        }
        Ok(accesses.len())
    }

    async fn delete_backend_bucket(&self, bucket: &Bucket) -> Result<()> {
        let name = bucket.name_any();
        let Some(bucket_id) = bucket.bucket_id() else {
            debug!(bucket = %name, "bucket was never provisioned, skipping backend delete");
            return Ok(());
        };
        let req = DriverDeleteBucketRequest {
            bucket_id: bucket_id.to_string(),
            delete_context: to_hash_map(&bucket.spec.parameters),
        };
        match self.deps.provisioner.driver_delete_bucket(req).await {
            Ok(_) => info!(bucket = %name, bucket_id, "backend bucket deleted"),
            Err(status) if status.code() == Code::NotFound => {
                debug!(bucket = %name, bucket_id, "backend bucket already gone");
            }
            Err(status) => {
                let err = Error::Rpc(status);
                self.record_failure(bucket, reasons::BUCKET_DELETE_FAILED, actions::DELETE, &err)
                    .await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn release_claim(&self, bucket: &Bucket) -> Result<()> {
        if let Some(claim_ref) = &bucket.spec.bucket_claim {
            remove_finalizer::<_, BucketClaim>(
                self.deps.store.as_ref(),
                Some(&claim_ref.namespace),
                &claim_ref.name,
                finalizers::BUCKET_CLAIM,
            )
            .await?;
        }
        Ok(())
    }

    async fn record_failure(&self, bucket: &Bucket, reason: &str, action: &str, err: &Error) {
        self.deps.warn(bucket, reason, action, err.to_string()).await;
        let message = err.to_string();
        let res = modify_status(
            self.deps.store.as_ref(),
            None,
            &bucket.name_any(),
            |b: &mut Bucket| {
                let status = b.status.get_or_insert_default();
                if status.message.as_ref() == Some(&message) {
                    return false;
                }
                status.message = Some(message.clone());
                true
            },
        )
        .await;
        if let Err(e) = res {
            debug!(bucket = %bucket.name_any(), error = %e, "failed to record bucket status message");
        }
    }
}

#[async_trait]
impl<S: ResourceStore> Listener for BucketListener<S> {
    type Resource = Bucket;
    type Error = Error;

    #[tracing::instrument(skip_all, fields(bucket = %bucket.name_any()))]
    async fn add(&self, bucket: Arc<Bucket>) -> Result<()> {
        if !self.deps.owns(&bucket.spec.driver_name) {
            debug!(driver = %bucket.spec.driver_name, "skipping bucket of another driver");
            return Ok(());
        }
        if bucket.spec.bucket_class_name.is_empty() {
            return Err(Error::MissingField {
                kind: "Bucket",
                name: bucket.name_any(),
                field: "bucketClassName",
            });
        }
        if is_deleting(bucket.as_ref()) {
            return self.finalize(&bucket).await;
        }
        if bucket.is_ready() {
            debug!("bucket already provisioned");
            return Ok(());
        }
        self.provision(&bucket).await
    }

    #[tracing::instrument(skip_all, fields(bucket = %new.name_any()))]
    async fn update(&self, _old: Arc<Bucket>, new: Arc<Bucket>) -> Result<()> {
        if !is_deleting(new.as_ref()) || !self.deps.owns(&new.spec.driver_name) {
            return Ok(());
        }
        self.finalize(&new).await
    }

    #[tracing::instrument(skip_all, fields(bucket = %bucket.name_any()))]
    async fn delete(&self, bucket: Arc<Bucket>) -> Result<()> {
        if !self.deps.owns(&bucket.spec.driver_name) {
            return Ok(());
        }
        self.release_claim(&bucket).await?;
        info!("bucket removed");
        Ok(())
    }
}
