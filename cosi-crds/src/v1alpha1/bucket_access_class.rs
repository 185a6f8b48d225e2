use std::collections::BTreeMap;

use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

use super::AuthenticationType;

pub const NAME_GROUP_BUCKETACCESSCLASS: &str = "bucketaccessclasses.objectstorage.k8s.io";

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "objectstorage.k8s.io",
    version = "v1alpha1",
    kind = "BucketAccessClass",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct BucketAccessClassSpec {
    pub driver_name: String,
    #[serde(default)]
    pub authentication_type: AuthenticationType,
    /// Access policy parameters passed to the driver on grant
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}
