use std::sync::Arc;

use async_trait::async_trait;
use cosi_crds::v1alpha1::BucketAccessClass;
use cosi_reconcile::Listener;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::events::{actions, reasons};
use crate::store::ResourceStore;
use crate::{Dependencies, Error, Result};

/// Validates BucketAccessClasses. Classes are only read by the
/// BucketAccess listener, so there is nothing to provision.
pub struct BucketAccessClassListener<S> {
    deps: Dependencies<S>,
}

impl<S: ResourceStore> BucketAccessClassListener<S> {
    pub fn new(deps: Dependencies<S>) -> Self {
        Self { deps }
    }

    async fn validate(&self, class: &BucketAccessClass) {
        let driver = &class.spec.driver_name;
        if driver.is_empty() {
            warn!("bucket access class has no driverName");
            self.deps
                .warn(
                    class,
                    reasons::INVALID_CLASS,
                    actions::VALIDATE,
                    format!("BucketAccessClass {} is missing driverName", class.name_any()),
                )
                .await;
            return;
        }
        if !self.deps.owns(driver) {
            debug!(driver = %driver, "skipping bucket access class of another driver");
            return;
        }
        debug!(
            authentication_type = ?class.spec.authentication_type,
            "bucket access class is valid"
        );
    }
}

#[async_trait]
impl<S: ResourceStore> Listener for BucketAccessClassListener<S> {
    type Resource = BucketAccessClass;
    type Error = Error;

    #[tracing::instrument(skip_all, fields(class = %class.name_any()))]
    async fn add(&self, class: Arc<BucketAccessClass>) -> Result<()> {
        self.validate(&class).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(class = %new.name_any()))]
    async fn update(&self, _old: Arc<BucketAccessClass>, new: Arc<BucketAccessClass>) -> Result<()> {
        self.validate(&new).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(class = %class.name_any()))]
    async fn delete(&self, class: Arc<BucketAccessClass>) -> Result<()> {
        debug!(driver = %class.spec.driver_name, "bucket access class removed");
        Ok(())
    }
}
