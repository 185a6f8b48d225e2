use std::time::Duration;

use cosi_crds::v1alpha1::{
    Bucket, BucketAccess, BucketAccessClass, BucketClaim, BucketClass, bucket, bucket_access,
    bucket_access_class, bucket_claim, bucket_class,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::conditions;
use kube::runtime::wait::await_condition;
use kube::{Api, CustomResourceExt};
use tracing::info;

use crate::{Error, Result};

const FIELD_MANAGER: &str = "cosi-controller";
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

fn definitions() -> [(&'static str, CustomResourceDefinition); 5] {
    [
        (bucket::NAME_GROUP_BUCKET, Bucket::crd()),
        (bucket_claim::NAME_GROUP_BUCKETCLAIM, BucketClaim::crd()),
        (bucket_class::NAME_GROUP_BUCKETCLASS, BucketClass::crd()),
        (bucket_access::NAME_GROUP_BUCKETACCESS, BucketAccess::crd()),
        (
            bucket_access_class::NAME_GROUP_BUCKETACCESSCLASS,
            BucketAccessClass::crd(),
        ),
    ]
}

/// Server-side applies every CRD and waits until each is established.
pub async fn apply_crds(client: kube::Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let ssaply = PatchParams::apply(FIELD_MANAGER).force();
    for (name, crd) in definitions() {
        crds.patch(name, &ssaply, &Patch::Apply(&crd)).await?;
        let established = await_condition(crds.clone(), name, conditions::is_crd_established());
        match tokio::time::timeout(ESTABLISH_TIMEOUT, established).await {
            Ok(res) => {
                res?;
            }
            Err(_) => return Err(Error::CrdNotEstablished(name.to_string())),
        }
        info!(crd = name, "applied CRD");
    }
    Ok(())
}
