pub mod bucket;
pub mod bucket_access;
pub mod bucket_access_class;
pub mod bucket_claim;

use std::collections::{BTreeMap, HashMap};

pub use bucket::BucketListener;
pub use bucket_access::BucketAccessListener;
pub use bucket_access_class::BucketAccessClassListener;
pub use bucket_claim::BucketClaimListener;

fn to_hash_map(params: &BTreeMap<String, String>) -> HashMap<String, String> {
    params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}
