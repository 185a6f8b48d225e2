use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use cosi_api::identity_client::IdentityClient;
use cosi_api::provisioner_client::ProvisionerClient;
use cosi_api::{
    DriverCreateBucketRequest, DriverCreateBucketResponse, DriverDeleteBucketRequest,
    DriverDeleteBucketResponse, DriverGetInfoRequest, DriverGetInfoResponse,
    DriverGrantBucketAccessRequest, DriverGrantBucketAccessResponse,
    DriverRevokeBucketAccessRequest, DriverRevokeBucketAccessResponse,
};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tower::service_fn;
use tracing::info;

use crate::{Provisioner, Result, parse_unix_address};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Provisioner RPC client over a Unix domain socket.
#[derive(Clone, Debug)]
pub struct DriverClient {
    identity: IdentityClient<Channel>,
    provisioner: ProvisionerClient<Channel>,
    debug: bool,
}

impl DriverClient {
    /// Connects to `unix://` `address`. With `debug` set every request and
    /// response is logged, credential material excluded.
    pub async fn connect(address: &str, debug: bool) -> Result<Self> {
        let path = parse_unix_address(address)?;
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await?;
        Ok(Self::new(channel, debug))
    }

    pub fn new(channel: Channel, debug: bool) -> Self {
        Self {
            identity: IdentityClient::new(channel.clone()),
            provisioner: ProvisionerClient::new(channel),
            debug,
        }
    }

    fn log_request<T: Debug>(&self, method: &str, req: &T) {
        if self.debug {
            info!(method, request = ?req, "driver request");
        }
    }

    fn log_response<T: Debug>(&self, method: &str, rsp: &Result<T, Status>) {
        if self.debug {
            match rsp {
                Ok(rsp) => info!(method, response = ?rsp, "driver response"),
                Err(status) => info!(method, code = ?status.code(), message = status.message(), "driver error"),
            }
        }
    }
}

#[async_trait]
impl Provisioner for DriverClient {
    async fn driver_get_info(&self) -> Result<DriverGetInfoResponse, Status> {
        let req = DriverGetInfoRequest {};
        self.log_request("DriverGetInfo", &req);
        let rsp = self
            .identity
            .clone()
            .driver_get_info(Request::new(req))
            .await
            .map(|r| r.into_inner());
        self.log_response("DriverGetInfo", &rsp);
        rsp
    }

    async fn driver_create_bucket(
        &self,
        req: DriverCreateBucketRequest,
    ) -> Result<DriverCreateBucketResponse, Status> {
        self.log_request("DriverCreateBucket", &req);
        let rsp = self
            .provisioner
            .clone()
            .driver_create_bucket(Request::new(req))
            .await
            .map(|r| r.into_inner());
        self.log_response("DriverCreateBucket", &rsp);
        rsp
    }

    async fn driver_delete_bucket(
        &self,
        req: DriverDeleteBucketRequest,
    ) -> Result<DriverDeleteBucketResponse, Status> {
        self.log_request("DriverDeleteBucket", &req);
        let rsp = self
            .provisioner
            .clone()
            .driver_delete_bucket(Request::new(req))
            .await
            .map(|r| r.into_inner());
        self.log_response("DriverDeleteBucket", &rsp);
        rsp
    }

    async fn driver_grant_bucket_access(
        &self,
        req: DriverGrantBucketAccessRequest,
    ) -> Result<DriverGrantBucketAccessResponse, Status> {
        self.log_request("DriverGrantBucketAccess", &req);
        let rsp = self
            .provisioner
            .clone()
            .driver_grant_bucket_access(Request::new(req))
            .await
            .map(|r| r.into_inner());
        if self.debug {
            match &rsp {
                Ok(r) => info!(
                    method = "DriverGrantBucketAccess",
                    account_id = %r.account_id,
                    credentials = ?r.credentials.keys().collect::<Vec<_>>(),
                    "driver response"
                ),
                Err(_) => self.log_response("DriverGrantBucketAccess", &rsp),
            }
        }
        rsp
    }

    async fn driver_revoke_bucket_access(
        &self,
        req: DriverRevokeBucketAccessRequest,
    ) -> Result<DriverRevokeBucketAccessResponse, Status> {
        self.log_request("DriverRevokeBucketAccess", &req);
        let rsp = self
            .provisioner
            .clone()
            .driver_revoke_bucket_access(Request::new(req))
            .await
            .map(|r| r.into_inner());
        self.log_response("DriverRevokeBucketAccess", &rsp);
        rsp
    }
}
