pub mod bucket;
pub mod bucket_access;
pub mod bucket_access_class;
pub mod bucket_claim;
pub mod bucket_class;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use bucket::{Bucket, BucketClaimReference, BucketSpec, BucketStatus};
pub use bucket_access::{BucketAccess, BucketAccessSpec, BucketAccessStatus};
pub use bucket_access_class::{BucketAccessClass, BucketAccessClassSpec};
pub use bucket_claim::{BucketClaim, BucketClaimSpec, BucketClaimStatus};
pub use bucket_class::{BucketClass, BucketClassSpec};

/// What happens to the backend bucket when its Bucket object is deleted.
#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Copy, Debug)]
pub enum DeletionPolicy {
    /// The backend bucket is left in place.
    #[default]
    Retain,
    /// The backend bucket is deleted once no BucketAccess references it.
    Delete,
    /// The backend bucket is deleted without waiting for BucketAccess cleanup.
    Force,
}

impl DeletionPolicy {
    pub fn deletes_backend(&self) -> bool {
        matches!(self, DeletionPolicy::Delete | DeletionPolicy::Force)
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Copy, Debug)]
pub enum AuthenticationType {
    /// Access key and secret key credentials minted into a Secret.
    #[default]
    Key,
    /// Workload identity mapped from a ServiceAccount.
    #[serde(rename = "IAM")]
    Iam,
}

/// Data plane API a bucket is reached through.
#[derive(Serialize, Deserialize, JsonSchema, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ProtocolName {
    S3,
    Azure,
    #[serde(rename = "GCS")]
    Gcs,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_blob: Option<AzureProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsProtocol>,
}

impl Protocol {
    pub fn names(&self) -> Vec<ProtocolName> {
        let mut names = Vec::new();
        if self.s3.is_some() {
            names.push(ProtocolName::S3);
        }
        if self.azure_blob.is_some() {
            names.push(ProtocolName::Azure);
        }
        if self.gcs.is_some() {
            names.push(ProtocolName::Gcs);
        }
        names
    }
}

#[derive(Serialize, Deserialize, JsonSchema, PartialEq, Eq, Clone, Copy, Debug)]
pub enum S3SignatureVersion {
    S3V2,
    S3V4,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct S3Protocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_version: Option<S3SignatureVersion>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AzureProtocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_account: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GcsProtocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "projectID")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_type_wire_names() {
        assert_eq!(serde_json::to_string(&AuthenticationType::Key).unwrap(), "\"Key\"");
        assert_eq!(serde_json::to_string(&AuthenticationType::Iam).unwrap(), "\"IAM\"");
    }

    #[test]
    fn test_protocol_names() {
        let protocol = Protocol {
            s3: Some(S3Protocol::default()),
            gcs: Some(GcsProtocol::default()),
            ..Default::default()
        };
        assert_eq!(protocol.names(), vec![ProtocolName::S3, ProtocolName::Gcs]);
        assert!(Protocol::default().names().is_empty());
    }

    #[test]
    fn test_deletion_policy_default_retains() {
        assert_eq!(DeletionPolicy::default(), DeletionPolicy::Retain);
        assert!(!DeletionPolicy::Retain.deletes_backend());
        assert!(DeletionPolicy::Force.deletes_backend());
    }
}
