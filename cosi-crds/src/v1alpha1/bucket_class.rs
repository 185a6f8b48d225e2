use std::collections::BTreeMap;

use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

use super::DeletionPolicy;

pub const NAME_GROUP_BUCKETCLASS: &str = "bucketclasses.objectstorage.k8s.io";

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "objectstorage.k8s.io",
    version = "v1alpha1",
    kind = "BucketClass",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct BucketClassSpec {
    /// Name of the driver that provisions buckets of this class
    pub driver_name: String,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Default driver parameters for buckets of this class
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}
