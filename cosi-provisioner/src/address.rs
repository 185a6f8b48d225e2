use std::path::PathBuf;

use crate::{Error, Result};

const UNIX_SCHEME: &str = "unix://";

/// Socket path of a `unix:///path/to/socket` address.
pub fn parse_unix_address(address: &str) -> Result<PathBuf> {
    let Some(path) = address.strip_prefix(UNIX_SCHEME) else {
        return Err(Error::InvalidAddress(address.to_string()));
    };
    if !path.starts_with('/') || path.len() < 2 {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    Ok(PathBuf::from(path))
}
