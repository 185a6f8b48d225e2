use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Protocol;

pub const NAME_GROUP_BUCKETCLAIM: &str = "bucketclaims.objectstorage.k8s.io";

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "objectstorage.k8s.io",
    version = "v1alpha1",
    kind = "BucketClaim",
    status = "BucketClaimStatus",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimSpec {
    /// BucketClass used to provision a new Bucket
    #[serde(default)]
    pub bucket_class_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<Protocol>,
    /// Existing Bucket to bind to instead of provisioning one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_bucket_name: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimStatus {
    #[serde(default)]
    pub bucket_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
}

impl BucketClaim {
    /// Name of the Bucket this claim is bound to.
    pub fn bound_bucket(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.bucket_name.as_deref())
            .filter(|n| !n.is_empty())
    }

    pub fn is_ready(&self) -> bool {
        self.bound_bucket().is_some() && self.status.as_ref().is_some_and(|s| s.bucket_ready)
    }
}
