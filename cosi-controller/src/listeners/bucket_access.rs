use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use cosi_api::{
    CredentialDetails, DriverGrantBucketAccessRequest, DriverRevokeBucketAccessRequest,
};
use cosi_crds::bucket_info::{BucketInfo, BucketInfoSpec, SecretAzure, SecretS3};
use cosi_crds::v1alpha1::{
    AuthenticationType, Bucket, BucketAccess, BucketAccessClass, BucketClaim,
};
use cosi_crds::{ACCOUNT_NAME_PREFIX, BUCKET_INFO_PREFIX, BUCKET_INFO_SECRET_KEY, finalizers};
use cosi_reconcile::Listener;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use tonic::Code;
use tracing::{debug, info, warn};

use super::to_hash_map;
use crate::events::{actions, reasons};
use crate::store::{
    ResourceStore, add_finalizer, delete_if_exists, has_finalizer, is_already_exists,
    is_deleting, modify_status, remove_finalizer,
};
use crate::{Dependencies, Error, Result};

/// Grants and revokes backend credentials for BucketAccess objects and
/// keeps the minted Secret in step with the grant.
pub struct BucketAccessListener<S> {
    deps: Dependencies<S>,
}

/// A Bucket that is ready to receive grants.
struct Target {
    bucket: Bucket,
    bucket_id: String,
}

impl<S: ResourceStore> BucketAccessListener<S> {
    pub fn new(deps: Dependencies<S>) -> Self {
        Self { deps }
    }

    async fn access_class(&self, access: &BucketAccess) -> Result<Option<BucketAccessClass>> {
        Ok(self
            .deps
            .store
            .get::<BucketAccessClass>(None, &access.spec.bucket_access_class_name)
            .await?)
    }

    /// Follows the access's claim to its bound Bucket. Returns `None` while
    /// the claim is unbound or the Bucket is not ready.
    async fn resolve_target(&self, access: &BucketAccess) -> Result<Option<Target>> {
        let namespace = access.namespace();
        let claim_name = &access.spec.bucket_claim_name;
        let Some(claim) = self
            .deps
            .store
            .get::<BucketClaim>(namespace.as_deref(), claim_name)
            .await?
        else {
            return Ok(None);
        };
        let Some(bucket_name) = claim.bound_bucket() else {
            return Ok(None);
        };
        let Some(bucket) = self.deps.store.get::<Bucket>(None, bucket_name).await? else {
            return Ok(None);
        };
        let Some(bucket_id) = bucket.bucket_id().map(str::to_string) else {
            return Ok(None);
        };
        Ok(Some(Target { bucket, bucket_id }))
    }

    async fn grant(&self, access: &BucketAccess) -> Result<()> {
        let name = access.name_any();
        let namespace = access.namespace();
        let ns = namespace.as_deref();
        let store = self.deps.store.as_ref();

        let secret_name = &access.spec.credentials_secret_name;
        if secret_name.is_empty() {
            return Err(Error::MissingField {
                kind: "BucketAccess",
                name,
                field: "credentialsSecretName",
            });
        }

        let Some(class) = self.access_class(access).await? else {
            let err = Error::ClassNotFound {
                kind: "BucketAccessClass",
                name: access.spec.bucket_access_class_name.clone(),
            };
            self.deps
                .warn(access, reasons::GRANTING_ACCESS_FAILED, actions::GRANT, err.to_string())
                .await;
            return Err(err);
        };
        if !self.deps.owns(&class.spec.driver_name) {
            debug!(driver = %class.spec.driver_name, "skipping bucket access of another driver");
            return Ok(());
        }

        let claim_name = &access.spec.bucket_claim_name;
        let Some(claim) = store.get::<BucketClaim>(ns, claim_name).await? else {
            return Err(Error::NotFound {
                kind: "BucketClaim",
                name: claim_name.clone(),
            });
        };
        let target = match claim.is_ready() {
            true => self.resolve_target(access).await?,
            false => None,
        };
        let Some(Target { bucket, bucket_id }) =
            target.filter(|t| t.bucket.is_ready() && !is_deleting(&t.bucket))
        else {
            let err = Error::WaitingForBucket(access.spec.bucket_claim_name.clone());
            self.deps
                .normal(access, reasons::WAITING_FOR_BUCKET, actions::GRANT, err.to_string())
                .await;
            return Err(err);
        };

        let authentication_type = class.spec.authentication_type;
        if authentication_type == AuthenticationType::Iam
            && access
                .spec
                .service_account_name
                .as_deref()
                .is_none_or(str::is_empty)
        {
            return Err(Error::MissingServiceAccount(name));
        }

        let uid = access.uid().unwrap_or_default();
        let account_name = format!("{ACCOUNT_NAME_PREFIX}{uid}");
        let req = DriverGrantBucketAccessRequest {
            bucket_id: bucket_id.clone(),
            name: account_name.clone(),
            authentication_type: rpc_authentication_type(authentication_type) as i32,
            parameters: to_hash_map(&class.spec.parameters),
        };

        // Held from before the grant so a half finished grant is still
        // revoked when the access is deleted.
        add_finalizer::<_, BucketAccess>(store, ns, &name, finalizers::BUCKET_ACCESS).await?;

        let secret_exists = store.get::<Secret>(ns, secret_name).await?.is_some();
        let account_id = match self.deps.provisioner.driver_grant_bucket_access(req).await {
            Ok(rsp) => {
                let checked = match rsp.account_id.is_empty() {
                    true => Err(Error::EmptyAccountId(name.clone())),
                    false => bucket_info(access, &bucket, authentication_type, &rsp.credentials),
                };
                let info = match checked {
                    Ok(info) => info,
                    Err(err) => {
                        self.deps
                            .warn(access, reasons::GRANTING_ACCESS_FAILED, actions::GRANT, err.to_string())
                            .await;
                        return Err(err);
                    }
                };
                self.record_account_id(access, &rsp.account_id).await?;
                if !secret_exists {
                    self.mint_secret(access, &info).await?;
                }
                rsp.account_id
            }
            Err(status) if status.code() == Code::AlreadyExists => {
                if !secret_exists {
                    return Err(Error::InvalidCredentials {
                        name,
                        reason: "access already granted but no credentials were minted".into(),
                    });
                }
                self.recorded_account_id(access, &account_name).await?
            }
            Err(status) => {
                let err = Error::Rpc(status);
                self.deps
                    .warn(access, reasons::GRANTING_ACCESS_FAILED, actions::GRANT, err.to_string())
                    .await;
                return Err(err);
            }
        };

        add_finalizer::<_, Bucket>(store, None, &bucket.name_any(), finalizers::BUCKET_ACCESS_BUCKET)
            .await?;
        modify_status(store, ns, &name, |ba: &mut BucketAccess| {
            let status = ba.status.get_or_insert_default();
            let changed = !status.access_granted || status.account_id.as_ref() != Some(&account_id);
            status.access_granted = true;
            status.account_id = Some(account_id.clone());
            changed
        })
        .await?;

        info!(bucket = %bucket.name_any(), account_id = %account_id, "access granted");
        Ok(())
    }

    /// Persists the driver's account id ahead of the rest of the grant.
    async fn record_account_id(&self, access: &BucketAccess, account_id: &str) -> Result<()> {
        modify_status(
            self.deps.store.as_ref(),
            access.namespace().as_deref(),
            &access.name_any(),
            |ba: &mut BucketAccess| {
                let status = ba.status.get_or_insert_default();
                if status.account_id.as_deref() == Some(account_id) {
                    return false;
                }
                status.account_id = Some(account_id.to_string());
                true
            },
        )
        .await?;
        Ok(())
    }

    /// Account id of a grant the driver already knows about, as recorded by
    /// the attempt that made it.
    async fn recorded_account_id(&self, access: &BucketAccess, account_name: &str) -> Result<String> {
        let latest = self
            .deps
            .store
            .get::<BucketAccess>(access.namespace().as_deref(), &access.name_any())
            .await?;
        match latest.as_ref().and_then(BucketAccess::account_id) {
            Some(id) => {
                debug!(account_id = id, "access already granted in the backend");
                Ok(id.to_string())
            }
            None => {
                warn!(account = account_name, "no account id recorded for an existing grant, using the account name");
                Ok(account_name.to_string())
            }
        }
    }

    async fn mint_secret(&self, access: &BucketAccess, info: &BucketInfo) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(access.spec.credentials_secret_name.clone()),
                namespace: access.namespace(),
                finalizers: Some(vec![finalizers::SECRET.to_string()]),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(
                BUCKET_INFO_SECRET_KEY.to_string(),
                serde_json::to_string(info)?,
            )])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        match self.deps.store.create(&secret).await {
            Ok(_) => {
                debug!(secret = %access.spec.credentials_secret_name, "minted credentials secret");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Revokes the backend account, then drops the minted Secret and the
    /// access's own finalizer.
    async fn revoke(&self, access: &BucketAccess) -> Result<()> {
        let name = access.name_any();
        let namespace = access.namespace();
        let ns = namespace.as_deref();
        let store = self.deps.store.as_ref();

        let class = self.access_class(access).await?;
        if let Some(class) = &class
            && !self.deps.owns(&class.spec.driver_name)
        {
            return Ok(());
        }

        match (access.account_id(), self.resolve_target(access).await?) {
            (Some(account_id), Some(Target { bucket_id, .. })) => {
                let req = DriverRevokeBucketAccessRequest {
                    bucket_id,
                    account_id: account_id.to_string(),
                    revoke_access_context: class
                        .as_ref()
                        .map(|c| to_hash_map(&c.spec.parameters))
                        .unwrap_or_else(HashMap::new),
                };
                match self.deps.provisioner.driver_revoke_bucket_access(req).await {
                    Ok(_) => info!(account_id, "access revoked"),
                    Err(status) if status.code() == Code::NotFound => {
                        debug!(account_id, "access already revoked");
                    }
                    Err(status) => {
                        let err = Error::Rpc(status);
                        self.deps
                            .warn(access, reasons::REVOKING_ACCESS_FAILED, actions::REVOKE, err.to_string())
                            .await;
                        return Err(err);
                    }
                }
            }
            (Some(account_id), None) => {
                debug!(account_id, "bucket is gone, nothing to revoke");
            }
            (None, _) => debug!("access was never granted"),
        }

        let secret_name = &access.spec.credentials_secret_name;
        if !secret_name.is_empty() {
            remove_finalizer::<_, Secret>(store, ns, secret_name, finalizers::SECRET).await?;
            delete_if_exists::<_, Secret>(store, ns, secret_name).await?;
        }
        remove_finalizer::<_, BucketAccess>(store, ns, &name, finalizers::BUCKET_ACCESS).await?;
        info!("bucket access released");
        Ok(())
    }
}

fn rpc_authentication_type(auth: AuthenticationType) -> cosi_api::AuthenticationType {
    match auth {
        AuthenticationType::Key => cosi_api::AuthenticationType::Key,
        AuthenticationType::Iam => cosi_api::AuthenticationType::Iam,
    }
}

/// Translates the single credential bundle of a grant into the document
/// stored in the minted Secret.
fn bucket_info(
    access: &BucketAccess,
    bucket: &Bucket,
    authentication_type: AuthenticationType,
    credentials: &HashMap<String, CredentialDetails>,
) -> Result<BucketInfo> {
    let invalid = |reason: String| Error::InvalidCredentials {
        name: access.name_any(),
        reason,
    };
    if credentials.len() != 1 {
        return Err(invalid(format!(
            "expected exactly one credential bundle, got {}",
            credentials.len()
        )));
    }

    let mut spec = BucketInfoSpec {
        bucket_name: bucket.name_any(),
        authentication_type,
        protocols: access.spec.protocol.into_iter().collect(),
        s3: None,
        azure: None,
    };
    let secret = |details: &CredentialDetails, key: &str| {
        details.secrets.get(key).cloned().unwrap_or_default()
    };
    if let Some(details) = credentials.get(cosi_api::S3_KEY) {
        spec.s3 = Some(SecretS3 {
            endpoint: secret(details, cosi_api::S3_ENDPOINT),
            region: secret(details, cosi_api::S3_REGION),
            access_key_id: secret(details, cosi_api::S3_ACCESS_KEY_ID),
            access_secret_key: secret(details, cosi_api::S3_ACCESS_SECRET_KEY),
        });
    } else if let Some(details) = credentials.get(cosi_api::AZURE_KEY) {
        spec.azure = Some(SecretAzure {
            access_token: secret(details, cosi_api::AZURE_ACCESS_TOKEN),
            expiry_time_stamp: details
                .secrets
                .get(cosi_api::AZURE_EXPIRY_TIMESTAMP)
                .filter(|ts| !ts.is_empty())
                .cloned(),
        });
    } else {
        let provider = credentials.keys().next().cloned().unwrap_or_default();
        return Err(invalid(format!("unsupported credential provider {provider:?}")));
    }

    let uid = access.uid().unwrap_or_default();
    Ok(BucketInfo::new(format!("{BUCKET_INFO_PREFIX}{uid}"), spec))
}

#[async_trait]
impl<S: ResourceStore> Listener for BucketAccessListener<S> {
    type Resource = BucketAccess;
    type Error = Error;

    #[tracing::instrument(skip_all, fields(access = %access.name_any(), namespace = ?access.namespace()))]
    async fn add(&self, access: Arc<BucketAccess>) -> Result<()> {
        if is_deleting(access.as_ref()) {
            if has_finalizer(access.as_ref(), finalizers::BUCKET_ACCESS) {
                return self.revoke(&access).await;
            }
            return Ok(());
        }
        if access.is_granted() {
            debug!("access already granted");
            return Ok(());
        }
        self.grant(&access).await
    }

    #[tracing::instrument(skip_all, fields(access = %new.name_any(), namespace = ?new.namespace()))]
    async fn update(&self, _old: Arc<BucketAccess>, new: Arc<BucketAccess>) -> Result<()> {
        if !is_deleting(new.as_ref()) || !has_finalizer(new.as_ref(), finalizers::BUCKET_ACCESS) {
            return Ok(());
        }
        self.revoke(&new).await
    }

    #[tracing::instrument(skip_all, fields(access = %access.name_any(), namespace = ?access.namespace()))]
    async fn delete(&self, access: Arc<BucketAccess>) -> Result<()> {
        debug!(claim = %access.spec.bucket_claim_name, "bucket access removed");
        Ok(())
    }
}
