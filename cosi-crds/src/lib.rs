use thiserror::Error;

pub mod bucket_info;
pub mod v1alpha1;

use kube::CustomResourceExt;

pub const GROUP: &str = "objectstorage.k8s.io";

/// Prefix of the account name handed to the driver on grant.
pub const ACCOUNT_NAME_PREFIX: &str = "ba-";
/// Prefix of the name stored in the minted BucketInfo document.
pub const BUCKET_INFO_PREFIX: &str = "bc-";
/// Key of the minted Secret holding the BucketInfo JSON document.
pub const BUCKET_INFO_SECRET_KEY: &str = "BucketInfo";

pub mod finalizers {
    /// Held by a BucketAccess on the Bucket it reads from.
    pub const BUCKET_ACCESS_BUCKET: &str =
        "cosi.objectstorage.k8s.io/bucketaccess-bucket-protection";
    pub const BUCKET_ACCESS: &str = "cosi.objectstorage.k8s.io/bucketaccess-protection";
    /// Held on a BucketClaim until its Bucket is cleaned up.
    pub const BUCKET_CLAIM: &str = "cosi.objectstorage.k8s.io/bucketclaim-protection";
    pub const BUCKET: &str = "cosi.objectstorage.k8s.io/bucket-protection";
    pub const SECRET: &str = "cosi.objectstorage.k8s.io/secret-protection";
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        v1alpha1::bucket::Bucket::crd(),
        v1alpha1::bucket_claim::BucketClaim::crd(),
        v1alpha1::bucket_class::BucketClass::crd(),
        v1alpha1::bucket_access::BucketAccess::crd(),
        v1alpha1::bucket_access_class::BucketAccessClass::crd(),
    ]
}

pub fn crd_gen_all() -> Result<()> {
    for crd in crds() {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crds_share_group_and_version() {
        let crds = crds();
        assert_eq!(crds.len(), 5);
        for crd in crds {
            assert_eq!(crd.spec.group, GROUP);
            assert_eq!(crd.spec.versions[0].name, "v1alpha1");
            let subresources = crd.spec.versions[0]
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref());
            let kind = crd.spec.names.kind.as_str();
            match kind {
                "BucketClass" | "BucketAccessClass" => assert!(subresources.is_none(), "{kind}"),
                _ => assert!(subresources.is_some(), "{kind}"),
            }
        }
    }

    #[test]
    fn test_crd_scopes() {
        for crd in crds() {
            let expected = match crd.spec.names.kind.as_str() {
                "BucketClaim" | "BucketAccess" => "Namespaced",
                _ => "Cluster",
            };
            assert_eq!(crd.spec.scope, expected, "{}", crd.spec.names.kind);
        }
    }

    #[test]
    fn test_class_fields_live_under_spec() {
        for crd in crds() {
            let kind = crd.spec.names.kind.clone();
            let expected: &[&str] = match kind.as_str() {
                "BucketClass" => &["driverName", "deletionPolicy", "parameters"],
                "BucketAccessClass" => &["driverName", "authenticationType", "parameters"],
                _ => continue,
            };
            let schema = crd.spec.versions[0]
                .schema
                .as_ref()
                .and_then(|s| s.open_api_v3_schema.as_ref())
                .and_then(|s| s.properties.as_ref())
                .unwrap();
            let spec = schema["spec"].properties.as_ref().unwrap();
            for field in expected {
                assert!(spec.contains_key(*field), "{kind} spec.{field}");
                assert!(!schema.contains_key(*field), "{kind} top level {field}");
            }
        }
    }
}
