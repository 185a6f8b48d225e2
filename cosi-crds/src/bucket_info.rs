//! Credential document minted into the Secret of a granted BucketAccess.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::v1alpha1::{AuthenticationType, ProtocolName};

pub const BUCKET_INFO_API_VERSION: &str = "objectstorage.k8s.io/v1alpha1";
pub const BUCKET_INFO_KIND: &str = "BucketInfo";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: BucketInfoSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfoSpec {
    pub bucket_name: String,
    pub authentication_type: AuthenticationType,
    #[serde(default)]
    pub protocols: Vec<ProtocolName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<SecretS3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<SecretAzure>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretS3 {
    pub endpoint: String,
    pub region: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub access_secret_key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretAzure {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time_stamp: Option<String>,
}

impl BucketInfo {
    pub fn new(name: impl Into<String>, spec: BucketInfoSpec) -> Self {
        Self {
            api_version: BUCKET_INFO_API_VERSION.into(),
            kind: BUCKET_INFO_KIND.into(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_payload_field_names() {
        let info = BucketInfo::new(
            "bc-1234",
            BucketInfoSpec {
                bucket_name: "b1".into(),
                authentication_type: AuthenticationType::Key,
                protocols: vec![ProtocolName::S3],
                s3: Some(SecretS3 {
                    endpoint: "https://s3.example.com".into(),
                    region: "us-east-1".into(),
                    access_key_id: "AKID".into(),
                    access_secret_key: "secret".into(),
                }),
                azure: None,
            },
        );
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["kind"], "BucketInfo");
        assert_eq!(value["metadata"]["name"], "bc-1234");
        assert_eq!(value["spec"]["bucketName"], "b1");
        assert_eq!(value["spec"]["authenticationType"], "Key");
        assert_eq!(value["spec"]["protocols"][0], "S3");
        assert_eq!(value["spec"]["s3"]["accessKeyID"], "AKID");
        assert_eq!(value["spec"]["s3"]["accessSecretKey"], "secret");
        assert!(value["spec"].get("azure").is_none());
    }
}
