use std::sync::Arc;

use async_trait::async_trait;
use cosi_crds::finalizers;
use cosi_crds::v1alpha1::{Bucket, BucketClaim, BucketClaimReference, BucketClass, BucketSpec};
use cosi_reconcile::Listener;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::events::{actions, reasons};
use crate::store::{
    ResourceStore, add_finalizer, delete_if_exists, has_finalizer, is_already_exists,
    is_deleting, modify, modify_status, remove_finalizer,
};
use crate::{Dependencies, Error, Result};

/// Binds BucketClaims to Buckets, creating the Bucket from the claim's
/// class when the claim does not name an existing one.
pub struct BucketClaimListener<S> {
    deps: Dependencies<S>,
}

impl<S: ResourceStore> BucketClaimListener<S> {
    pub fn new(deps: Dependencies<S>) -> Self {
        Self { deps }
    }

    fn claim_ref(claim: &BucketClaim) -> BucketClaimReference {
        BucketClaimReference {
            name: claim.name_any(),
            namespace: claim.namespace().unwrap_or_default(),
            uid: claim.uid(),
        }
    }

    /// Binds the claim to a Bucket that already exists.
    async fn bind_existing(&self, claim: &BucketClaim, bucket_name: &str) -> Result<()> {
        let store = self.deps.store.as_ref();
        let namespace = claim.namespace();
        let ns = namespace.as_deref();

        let Some(bucket) = store.get::<Bucket>(None, bucket_name).await? else {
            return Err(Error::NotFound {
                kind: "Bucket",
                name: bucket_name.to_string(),
            });
        };
        if !self.deps.owns(&bucket.spec.driver_name) {
            debug!(driver = %bucket.spec.driver_name, "skipping claim of a bucket of another driver");
            return Ok(());
        }

        let claim_ref = Self::claim_ref(claim);
        let mut bound_elsewhere = None;
        modify(store, None, bucket_name, |b: &mut Bucket| match &b.spec.bucket_claim {
            Some(r) if r.name == claim_ref.name && r.namespace == claim_ref.namespace => false,
            Some(r) => {
                bound_elsewhere = Some(format!("{}/{}", r.namespace, r.name));
                false
            }
            None => {
                b.spec.bucket_claim = Some(claim_ref.clone());
                true
            }
        })
        .await?;
        if let Some(other) = bound_elsewhere {
            return Err(Error::BucketBoundElsewhere {
                bucket: bucket_name.to_string(),
                claim: other,
            });
        }

        add_finalizer::<_, BucketClaim>(store, ns, &claim.name_any(), finalizers::BUCKET_CLAIM)
            .await?;
        let ready = bucket.is_ready();
        modify_status(store, ns, &claim.name_any(), |c: &mut BucketClaim| {
            let status = c.status.get_or_insert_default();
            status.bucket_name = Some(bucket_name.to_string());
            status.bucket_ready = ready;
            true
        })
        .await?;

        info!(bucket = bucket_name, ready, "claim bound to existing bucket");
        Ok(())
    }

    /// Creates a Bucket from the claim's class and binds the claim to it.
    async fn provision(&self, claim: &BucketClaim) -> Result<()> {
        let store = self.deps.store.as_ref();
        let name = claim.name_any();
        let namespace = claim.namespace();
        let ns = namespace.as_deref();

        let class_name = &claim.spec.bucket_class_name;
        if class_name.is_empty() {
            return Err(Error::MissingBucketClassName(name));
        }
        let Some(class) = store.get::<BucketClass>(None, class_name).await? else {
            let err = Error::ClassNotFound {
                kind: "BucketClass",
                name: class_name.clone(),
            };
            self.deps
                .warn(claim, reasons::PROVISIONING_FAILED, actions::PROVISION, err.to_string())
                .await;
            return Err(err);
        };
        if !self.deps.owns(&class.spec.driver_name) {
            debug!(driver = %class.spec.driver_name, "skipping claim of another driver");
            return Ok(());
        }

        let bucket_name = format!("{class_name}-{}", claim.uid().unwrap_or_default());
        let bucket = Bucket {
            metadata: ObjectMeta {
                name: Some(bucket_name.clone()),
                ..Default::default()
            },
            spec: BucketSpec {
                driver_name: class.spec.driver_name.clone(),
                bucket_class_name: class_name.clone(),
                bucket_claim: Some(Self::claim_ref(claim)),
                protocols: claim.spec.protocols.clone(),
                parameters: class.spec.parameters.clone(),
                deletion_policy: class.spec.deletion_policy,
                existing_bucket_id: None,
            },
            status: None,
        };
        match store.create(&bucket).await {
            Ok(_) => info!(bucket = %bucket_name, "bucket created for claim"),
            Err(e) if is_already_exists(&e) => debug!(bucket = %bucket_name, "bucket already exists"),
            Err(e) => return Err(e.into()),
        }

        add_finalizer::<_, BucketClaim>(store, ns, &name, finalizers::BUCKET_CLAIM).await?;
        modify_status(store, ns, &name, |c: &mut BucketClaim| {
            let status = c.status.get_or_insert_default();
            if status.bucket_name.is_some() {
                return false;
            }
            status.bucket_name = Some(bucket_name.clone());
            true
        })
        .await?;
        Ok(())
    }

    /// Starts teardown of the bound Bucket. The Bucket listener drops the
    /// claim's finalizer once the backend is cleaned up.
    async fn release(&self, claim: &BucketClaim) -> Result<()> {
        let store = self.deps.store.as_ref();
        let namespace = claim.namespace();
        let ns = namespace.as_deref();

        if let Some(bucket_name) = claim.bound_bucket() {
            if let Some(bucket) = store.get::<Bucket>(None, bucket_name).await? {
                if !self.deps.owns(&bucket.spec.driver_name) {
                    return Ok(());
                }
                if !is_deleting(&bucket) {
                    delete_if_exists::<_, Bucket>(store, None, bucket_name).await?;
                    info!(bucket = bucket_name, "deleting bucket of released claim");
                }
                return Ok(());
            }
            debug!(bucket = bucket_name, "bound bucket is already gone");
        }

        remove_finalizer::<_, BucketClaim>(store, ns, &claim.name_any(), finalizers::BUCKET_CLAIM)
            .await?;
        info!("bucket claim released");
        Ok(())
    }
}

#[async_trait]
impl<S: ResourceStore> Listener for BucketClaimListener<S> {
    type Resource = BucketClaim;
    type Error = Error;

    #[tracing::instrument(skip_all, fields(claim = %claim.name_any(), namespace = ?claim.namespace()))]
    async fn add(&self, claim: Arc<BucketClaim>) -> Result<()> {
        if is_deleting(claim.as_ref()) {
            if has_finalizer(claim.as_ref(), finalizers::BUCKET_CLAIM) {
                return self.release(&claim).await;
            }
            return Ok(());
        }
        if let Some(bucket) = claim.bound_bucket() {
            debug!(bucket, "claim already bound");
            return Ok(());
        }
        match claim
            .spec
            .existing_bucket_name
            .as_deref()
            .filter(|n| !n.is_empty())
        {
            Some(existing) => self.bind_existing(&claim, existing).await,
            None => self.provision(&claim).await,
        }
    }

    #[tracing::instrument(skip_all, fields(claim = %new.name_any(), namespace = ?new.namespace()))]
    async fn update(&self, _old: Arc<BucketClaim>, new: Arc<BucketClaim>) -> Result<()> {
        if !is_deleting(new.as_ref()) || !has_finalizer(new.as_ref(), finalizers::BUCKET_CLAIM) {
            return Ok(());
        }
        self.release(&new).await
    }

    #[tracing::instrument(skip_all, fields(claim = %claim.name_any(), namespace = ?claim.namespace()))]
    async fn delete(&self, claim: Arc<BucketClaim>) -> Result<()> {
        debug!(bucket = ?claim.bound_bucket(), "bucket claim removed");
        Ok(())
    }
}
