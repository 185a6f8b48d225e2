use std::fs;
use std::io::ErrorKind;

use cosi_api::identity_server::{Identity, IdentityServer};
use cosi_api::provisioner_server::{Provisioner as ProvisionerService, ProvisionerServer};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tracing::info;

use crate::{Result, parse_unix_address};

/// Serves the driver RPC surface on the `unix://` `address` until `cancel`
/// fires. A stale socket file at the path is removed first.
pub async fn serve<I, P>(
    address: &str,
    identity: I,
    provisioner: P,
    cancel: CancellationToken,
) -> Result<()>
where
    I: Identity,
    P: ProvisionerService,
{
    let path = parse_unix_address(address)?;
    if let Err(e) = fs::remove_file(&path)
        && e.kind() != ErrorKind::NotFound
    {
        return Err(e.into());
    }
    let Some(parent) = path.parent() else {
        return Err(std::io::Error::new(
            ErrorKind::NotFound,
            format!("parent of path {} could not resolve", path.display()),
        )
        .into());
    };
    fs::create_dir_all(parent)?;
    let listener = UnixListener::bind(&path)?;
    let stream = UnixListenerStream::new(listener);
    info!(path = %path.display(), "driver listening");

    let mut routes = RoutesBuilder::default();
    routes
        .add_service(IdentityServer::new(identity))
        .add_service(ProvisionerServer::new(provisioner));

    Server::builder()
        .add_routes(routes.routes())
        .serve_with_incoming_shutdown(stream, async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
