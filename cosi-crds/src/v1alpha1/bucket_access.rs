use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ProtocolName;

pub const NAME_GROUP_BUCKETACCESS: &str = "bucketaccesses.objectstorage.k8s.io";

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "objectstorage.k8s.io",
    version = "v1alpha1",
    kind = "BucketAccess",
    status = "BucketAccessStatus",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BucketAccessSpec {
    /// BucketClaim in the same namespace whose Bucket is accessed
    pub bucket_claim_name: String,
    pub bucket_access_class_name: String,
    /// Secret the minted credentials are written to
    #[serde(default)]
    pub credentials_secret_name: String,
    /// ServiceAccount mapped to the backend identity, IAM only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolName>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BucketAccessStatus {
    #[serde(default)]
    pub access_granted: bool,
    #[serde(default, rename = "accountID", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl BucketAccess {
    pub fn account_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.account_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Granted with a non-empty account id.
    pub fn is_granted(&self) -> bool {
        self.account_id().is_some() && self.status.as_ref().is_some_and(|s| s.access_granted)
    }
}
