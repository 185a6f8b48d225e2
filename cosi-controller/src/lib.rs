pub mod config;
pub mod controller;
pub mod crds;
pub mod dependencies;
pub mod events;
pub mod http;
pub mod listeners;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use cosi_reconcile::ReconcileError;
use thiserror::Error;

pub use dependencies::Dependencies;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("driver call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("{0}")]
    Provisioner(#[from] cosi_provisioner::Error),

    #[error("{0}")]
    Reconcile(#[from] cosi_reconcile::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("{0}")]
    Crds(#[from] cosi_crds::Error),

    #[error("failed to create config from kubeconfig: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),

    #[error("failed waiting for condition: {0}")]
    Wait(#[from] kube::runtime::wait::Error),

    #[error("{kind} {name} is missing {field}")]
    MissingField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("{kind} {name} not found")]
    ClassNotFound { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("bucket claim {0} has neither bucketClassName nor existingBucketName")]
    MissingBucketClassName(String),

    #[error("bucket access {0} requests IAM authentication without a serviceAccountName")]
    MissingServiceAccount(String),

    #[error("bucket {bucket} is already bound to claim {claim}")]
    BucketBoundElsewhere { bucket: String, claim: String },

    #[error("driver returned an empty bucket id for {0}")]
    EmptyBucketId(String),

    #[error("driver returned an empty account id for {0}")]
    EmptyAccountId(String),

    #[error("driver returned invalid credentials for {name}: {reason}")]
    InvalidCredentials { name: String, reason: String },

    #[error("driver returned an empty name")]
    EmptyDriverName,

    #[error("cannot determine leader election identity: {0}")]
    Identity(String),

    #[error("waiting for bucket of claim {0} to become ready")]
    WaitingForBucket(String),

    #[error("waiting for {count} bucket accesses of bucket {bucket} to be removed")]
    WaitingForBucketAccesses { bucket: String, count: usize },

    #[error("crd {0} was not established in time")]
    CrdNotEstablished(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcileError for Error {
    fn is_waiting(&self) -> bool {
        matches!(
            self,
            Error::WaitingForBucket(_) | Error::WaitingForBucketAccesses { .. }
        )
    }

    fn metric_label(&self) -> String {
        match self {
            Error::Kube(_) => "kube",
            Error::Rpc(_) | Error::Provisioner(_) => "rpc",
            Error::Reconcile(_) => "reconcile",
            Error::IoError(_) => "io",
            Error::JsonConversion(_) => "json",
            Error::Crds(_)
            | Error::KubeConfig(_)
            | Error::Wait(_)
            | Error::CrdNotEstablished(_)
            | Error::Identity(_) => "startup",
            Error::MissingField { .. }
            | Error::MissingBucketClassName(_)
            | Error::MissingServiceAccount(_)
            | Error::BucketBoundElsewhere { .. } => "invalid",
            Error::ClassNotFound { .. } | Error::NotFound { .. } => "not_found",
            Error::EmptyBucketId(_)
            | Error::EmptyAccountId(_)
            | Error::InvalidCredentials { .. }
            | Error::EmptyDriverName => "driver_contract",
            Error::WaitingForBucket(_) | Error::WaitingForBucketAccesses { .. } => "waiting",
        }
        .to_string()
    }
}
