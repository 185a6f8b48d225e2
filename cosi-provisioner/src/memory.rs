use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cosi_api::identity_server;
use cosi_api::provisioner_server;
use cosi_api::{
    CredentialDetails, DriverCreateBucketRequest, DriverCreateBucketResponse,
    DriverDeleteBucketRequest, DriverDeleteBucketResponse, DriverGetInfoRequest,
    DriverGetInfoResponse, DriverGrantBucketAccessRequest, DriverGrantBucketAccessResponse,
    DriverRevokeBucketAccessRequest, DriverRevokeBucketAccessResponse, S3_ACCESS_KEY_ID,
    S3_ACCESS_SECRET_KEY, S3_ENDPOINT, S3_KEY, S3_REGION,
};
use rand::Rng;
use rand::distr::Alphanumeric;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::Provisioner;

const DEFAULT_ENDPOINT: &str = "http://objectstorage.local:9000";
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq)]
struct StoredBucket {
    parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
struct StoredAccount {
    bucket_id: String,
    parameters: HashMap<String, String>,
    access_key_id: String,
    access_secret_key: String,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, StoredBucket>,
    accounts: HashMap<String, StoredAccount>,
}

/// Object store backend held entirely in memory.
///
/// Bucket ids equal the requested bucket name and account ids equal the
/// requested account name, so repeating a request with identical
/// parameters succeeds and returns the same identifiers.
#[derive(Clone, Debug)]
pub struct MemoryDriver {
    name: String,
    endpoint: String,
    region: String,
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            region: DEFAULT_REGION.to_string(),
            state: Arc::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, region: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self.region = region.into();
        self
    }

    pub fn has_bucket(&self, bucket_id: &str) -> bool {
        self.lock().buckets.contains_key(bucket_id)
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        self.lock().accounts.contains_key(account_id)
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().buckets.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_info(&self) -> DriverGetInfoResponse {
        DriverGetInfoResponse {
            name: self.name.clone(),
        }
    }

    fn create_bucket(
        &self,
        req: DriverCreateBucketRequest,
    ) -> Result<DriverCreateBucketResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("bucket name is required"));
        }
        let mut state = self.lock();
        let bucket = StoredBucket {
            parameters: req.parameters,
        };
        match state.buckets.get(&req.name) {
            Some(existing) if *existing != bucket => {
                return Err(Status::already_exists(format!(
                    "bucket {} exists with different parameters",
                    req.name
                )));
            }
            Some(_) => {}
            None => {
                info!(bucket = %req.name, "created bucket");
                state.buckets.insert(req.name.clone(), bucket);
            }
        }
        Ok(DriverCreateBucketResponse {
            bucket_id: req.name,
        })
    }

    fn delete_bucket(
        &self,
        req: DriverDeleteBucketRequest,
    ) -> Result<DriverDeleteBucketResponse, Status> {
        let mut state = self.lock();
        if state.buckets.remove(&req.bucket_id).is_none() {
            return Err(Status::not_found(format!(
                "bucket {} not found",
                req.bucket_id
            )));
        }
        state.accounts.retain(|_, a| a.bucket_id != req.bucket_id);
        info!(bucket = %req.bucket_id, "deleted bucket");
        Ok(DriverDeleteBucketResponse {})
    }

    fn grant_access(
        &self,
        req: DriverGrantBucketAccessRequest,
    ) -> Result<DriverGrantBucketAccessResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("account name is required"));
        }
        let mut state = self.lock();
        if !state.buckets.contains_key(&req.bucket_id) {
            return Err(Status::not_found(format!(
                "bucket {} not found",
                req.bucket_id
            )));
        }
        let account = match state.accounts.get(&req.name) {
            Some(existing)
                if existing.bucket_id != req.bucket_id || existing.parameters != req.parameters =>
            {
                return Err(Status::already_exists(format!(
                    "account {} exists with different parameters",
                    req.name
                )));
            }
            Some(existing) => existing.clone(),
            None => {
                let account = StoredAccount {
                    bucket_id: req.bucket_id.clone(),
                    parameters: req.parameters,
                    access_key_id: random_string(20),
                    access_secret_key: random_string(40),
                };
                info!(bucket = %req.bucket_id, account = %req.name, "granted access");
                state.accounts.insert(req.name.clone(), account.clone());
                account
            }
        };

        let secrets = HashMap::from([
            (S3_ENDPOINT.to_string(), self.endpoint.clone()),
            (S3_REGION.to_string(), self.region.clone()),
            (S3_ACCESS_KEY_ID.to_string(), account.access_key_id),
            (S3_ACCESS_SECRET_KEY.to_string(), account.access_secret_key),
        ]);
        Ok(DriverGrantBucketAccessResponse {
            account_id: req.name,
            credentials: HashMap::from([(S3_KEY.to_string(), CredentialDetails { secrets })]),
        })
    }

    fn revoke_access(
        &self,
        req: DriverRevokeBucketAccessRequest,
    ) -> Result<DriverRevokeBucketAccessResponse, Status> {
        let mut state = self.lock();
        match state.accounts.get(&req.account_id) {
            Some(a) if a.bucket_id == req.bucket_id => {
                state.accounts.remove(&req.account_id);
                info!(bucket = %req.bucket_id, account = %req.account_id, "revoked access");
                Ok(DriverRevokeBucketAccessResponse {})
            }
            _ => Err(Status::not_found(format!(
                "account {} not found on bucket {}",
                req.account_id, req.bucket_id
            ))),
        }
    }
}

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[async_trait]
impl Provisioner for MemoryDriver {
    async fn driver_get_info(&self) -> Result<DriverGetInfoResponse, Status> {
        Ok(self.get_info())
    }

    async fn driver_create_bucket(
        &self,
        req: DriverCreateBucketRequest,
    ) -> Result<DriverCreateBucketResponse, Status> {
        self.create_bucket(req)
    }

    async fn driver_delete_bucket(
        &self,
        req: DriverDeleteBucketRequest,
    ) -> Result<DriverDeleteBucketResponse, Status> {
        self.delete_bucket(req)
    }

    async fn driver_grant_bucket_access(
        &self,
        req: DriverGrantBucketAccessRequest,
    ) -> Result<DriverGrantBucketAccessResponse, Status> {
        self.grant_access(req)
    }

    async fn driver_revoke_bucket_access(
        &self,
        req: DriverRevokeBucketAccessRequest,
    ) -> Result<DriverRevokeBucketAccessResponse, Status> {
        self.revoke_access(req)
    }
}

#[tonic::async_trait]
impl identity_server::Identity for MemoryDriver {
    async fn driver_get_info(
        &self,
        _request: Request<DriverGetInfoRequest>,
    ) -> Result<Response<DriverGetInfoResponse>, Status> {
        Ok(Response::new(self.get_info()))
    }
}

#[tonic::async_trait]
impl provisioner_server::Provisioner for MemoryDriver {
    async fn driver_create_bucket(
        &self,
        request: Request<DriverCreateBucketRequest>,
    ) -> Result<Response<DriverCreateBucketResponse>, Status> {
        self.create_bucket(request.into_inner()).map(Response::new)
    }

    async fn driver_delete_bucket(
        &self,
        request: Request<DriverDeleteBucketRequest>,
    ) -> Result<Response<DriverDeleteBucketResponse>, Status> {
        self.delete_bucket(request.into_inner()).map(Response::new)
    }

    async fn driver_grant_bucket_access(
        &self,
        request: Request<DriverGrantBucketAccessRequest>,
    ) -> Result<Response<DriverGrantBucketAccessResponse>, Status> {
        self.grant_access(request.into_inner()).map(Response::new)
    }

    async fn driver_revoke_bucket_access(
        &self,
        request: Request<DriverRevokeBucketAccessRequest>,
    ) -> Result<Response<DriverRevokeBucketAccessResponse>, Status> {
        self.revoke_access(request.into_inner()).map(Response::new)
    }
}
