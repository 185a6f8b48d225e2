use clap::Parser;
use cosi_provisioner::MemoryDriver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// In-memory object storage driver serving the provisioner RPC.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Endpoint to serve on, unix:// only
    #[arg(long, env = "DRIVER_ADDRESS", default_value = "unix:///var/lib/cosi/cosi.sock")]
    address: String,

    /// Driver name reported by GetInfo
    #[arg(long, default_value = "sample.objectstorage.k8s.io")]
    name: String,

    /// Endpoint handed out in S3 credentials
    #[arg(long, default_value = "http://sample-objectstore:9000")]
    endpoint: String,

    /// Region handed out in S3 credentials
    #[arg(long, default_value = "us-east-1")]
    region: String,
}

#[tokio::main]
async fn main() -> cosi_provisioner::Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cosi_sample_driver=info,cosi_provisioner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let driver = MemoryDriver::new(&args.name).with_endpoint(args.endpoint, args.region);
    info!(name = %args.name, address = %args.address, "serving sample driver");
    cosi_provisioner::server::serve(&args.address, driver.clone(), driver, cancel).await?;
    info!("Exiting...");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "failed to listen for ctrl_c");
                return;
            }
            info!("captured ctrl_c signal");
        },
        _ = terminate => info!("captured SIGTERM signal"),
    }
    cancel.cancel();
}
