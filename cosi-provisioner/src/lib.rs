pub mod address;
pub mod client;
pub mod memory;
pub mod server;

use async_trait::async_trait;
use cosi_api::{
    DriverCreateBucketRequest, DriverCreateBucketResponse, DriverDeleteBucketRequest,
    DriverDeleteBucketResponse, DriverGetInfoResponse, DriverGrantBucketAccessRequest,
    DriverGrantBucketAccessResponse, DriverRevokeBucketAccessRequest,
    DriverRevokeBucketAccessResponse,
};
use thiserror::Error;
use tonic::Status;

pub use address::parse_unix_address;
pub use client::DriverClient;
pub use memory::MemoryDriver;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid driver address {0}: only unix:// addresses are supported")]
    InvalidAddress(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    TonicTransport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] Status),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The driver side of the provisioning boundary.
///
/// Mutating calls are idempotent: callers retry on any failure without
/// checking whether an earlier attempt went through.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
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
