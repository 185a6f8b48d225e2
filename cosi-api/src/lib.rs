pub mod cosi {
    pub mod v1alpha1 {
        tonic::include_proto!("cosi.v1alpha1");
    }
}

pub use cosi::v1alpha1::*;

/// Credential map key carrying S3 credentials.
pub const S3_KEY: &str = "s3";
/// Credential map key carrying Azure credentials.
pub const AZURE_KEY: &str = "azure";

pub const S3_ENDPOINT: &str = "endpoint";
pub const S3_REGION: &str = "region";
pub const S3_ACCESS_KEY_ID: &str = "accessKeyID";
pub const S3_ACCESS_SECRET_KEY: &str = "accessSecretKey";

pub const AZURE_ACCESS_TOKEN: &str = "accessToken";
pub const AZURE_EXPIRY_TIMESTAMP: &str = "expiryTs";
