use std::collections::BTreeMap;

use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeletionPolicy, Protocol};

pub const NAME_GROUP_BUCKET: &str = "buckets.objectstorage.k8s.io";

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "objectstorage.k8s.io",
    version = "v1alpha1",
    kind = "Bucket",
    status = "BucketStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    /// Name of the driver responsible for this bucket
    pub driver_name: String,
    /// BucketClass this bucket was created from
    #[serde(default)]
    pub bucket_class_name: String,
    /// Claim that caused this bucket to be created, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_claim: Option<BucketClaimReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<Protocol>,
    /// Opaque parameters passed to the driver on create and delete
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Backend bucket id to adopt instead of creating a new bucket
    #[serde(default, rename = "existingBucketID", skip_serializing_if = "Option::is_none")]
    pub existing_bucket_id: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimReference {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    #[serde(default)]
    pub bucket_ready: bool,
    #[serde(default, rename = "bucketID", skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Bucket {
    /// Ready with a non-empty bucket id.
    pub fn is_ready(&self) -> bool {
        self.bucket_id().is_some() && self.status.as_ref().is_some_and(|s| s.bucket_ready)
    }

    pub fn bucket_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.bucket_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
