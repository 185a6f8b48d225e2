use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use cosi_crds::v1alpha1::{Bucket, BucketAccess, BucketAccessClass, BucketClaim};
use cosi_provisioner::{DriverClient, Provisioner};
use cosi_reconcile::{
    EngineConfig, KubeLeaseLock, LeaderElectionConfig, LeaderElector, run_for, sanitize_lock_name,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RunArgs;
use crate::events::KubeEventPublisher;
use crate::listeners::{
    BucketAccessClassListener, BucketAccessListener, BucketClaimListener, BucketListener,
};
use crate::store::KubeStore;
use crate::{Dependencies, Error, Result, crds};

const CONTROLLER_NAME: &str = "cosi-controller";
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

pub async fn start(
    args: RunArgs,
    ready: watch::Sender<bool>,
    cancel: CancellationToken,
) -> Result<()> {
    let client = kube_client(&args).await?;
    if args.install_crds {
        crds::apply_crds(client.clone()).await?;
    }

    info!(address = %args.driver_address, "connecting to driver");
    let driver = DriverClient::connect(&args.driver_address, args.debug).await?;
    let driver_name = driver.driver_get_info().await?.name;
    if driver_name.is_empty() {
        return Err(Error::EmptyDriverName);
    }
    info!(driver = %driver_name, "driver discovered");

    let identity = identity(args.identity.as_deref(), hostname::get)?;
    let namespace = lease_namespace(&args).await;
    let lock_name = sanitize_lock_name(&format!("{driver_name}/cosi"));
    let election = LeaderElectionConfig {
        lease_duration: Duration::from_secs(args.lease_duration),
        renew_deadline: Duration::from_secs(args.renew_deadline),
        retry_period: Duration::from_secs(args.retry_period),
        ..LeaderElectionConfig::new(&identity)
    };
    let elector = LeaderElector::new(KubeLeaseLock::new(client.clone(), &namespace, &lock_name), election);

    let deps = Dependencies::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(driver),
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME, Some(identity))),
        &driver_name,
    );
    let engine = args.engine_config();
    elector
        .run(cancel, move |leading| run_engines(client, deps, engine, ready, leading))
        .await?;
    Ok(())
}

async fn kube_client(args: &RunArgs) -> Result<Client> {
    let Some(path) = &args.kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Leader election identity: `explicit` when set, else the host name.
fn identity<F>(explicit: Option<&str>, hostname: F) -> Result<String>
where
    F: FnOnce() -> std::io::Result<OsString>,
{
    if let Some(identity) = explicit.filter(|i| !i.is_empty()) {
        return Ok(identity.to_string());
    }
    let host = hostname().map_err(|e| Error::Identity(e.to_string()))?;
    match host.to_string_lossy().trim() {
        "" => Err(Error::Identity("host name is empty".into())),
        host => Ok(host.to_string()),
    }
}

async fn lease_namespace(args: &RunArgs) -> String {
    if let Some(ns) = args.leader_election_namespace.as_ref().filter(|ns| !ns.is_empty()) {
        return ns.clone();
    }
    match tokio::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE).await {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => "default".to_string(),
    }
}

/// Runs one engine per watched kind until `leading` is cancelled or an
/// engine fails, which gives up leadership.
async fn run_engines(
    client: Client,
    deps: Dependencies<KubeStore>,
    config: EngineConfig,
    ready: watch::Sender<bool>,
    leading: CancellationToken,
) {
    let mut engines = JoinSet::new();
    engines.spawn(run_for(
        Api::<Bucket>::all(client.clone()),
        BucketListener::new(deps.clone()),
        config.clone(),
        leading.clone(),
    ));
    engines.spawn(run_for(
        Api::<BucketClaim>::all(client.clone()),
        BucketClaimListener::new(deps.clone()),
        config.clone(),
        leading.clone(),
    ));
    engines.spawn(run_for(
        Api::<BucketAccess>::all(client.clone()),
        BucketAccessListener::new(deps.clone()),
        config.clone(),
        leading.clone(),
    ));
    engines.spawn(run_for(
        Api::<BucketAccessClass>::all(client),
        BucketAccessClassListener::new(deps),
        config,
        leading.clone(),
    ));
    info!("reconcile engines started");

    let drain = async {
        while let Some(res) = engines.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "reconcile engine failed");
                    leading.cancel();
                }
                Err(e) => {
                    error!(error = %e, "reconcile engine task failed");
                    leading.cancel();
                }
            }
        }
        // no engine left to lead with
        leading.cancel();
    };
    tokio::join!(drain, ready_while_leading(&ready, &leading));
}

/// Reports ready from now until `leading` is cancelled.
async fn ready_while_leading(ready: &watch::Sender<bool>, leading: &CancellationToken) {
    ready.send_replace(true);
    leading.cancelled().await;
    ready.send_replace(false);
    info!("leadership ended, reporting not ready");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::StatusCode;
    use clap::Parser;
    use http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Cli, Commands};

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["cosi-controller", "run"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Commands::Run(args) => args,
            Commands::Crdgen => unreachable!(),
        }
    }

    fn no_hostname() -> std::io::Result<OsString> {
        Err(std::io::Error::other("no uts namespace"))
    }

    #[test]
    fn test_explicit_identity_wins() {
        let args = run_args(&["--identity", "pod-a"]);
        assert_eq!(identity(args.identity.as_deref(), no_hostname).unwrap(), "pod-a");
    }

    #[test]
    fn test_identity_falls_back_to_host_name() {
        let host = || Ok(OsString::from("node-1.example.com\n"));
        assert_eq!(identity(None, host).unwrap(), "node-1.example.com");
        assert_eq!(identity(Some(""), host).unwrap(), "node-1.example.com");
    }

    #[test]
    fn test_identity_without_host_name_fails() {
        assert!(matches!(identity(None, no_hostname), Err(Error::Identity(_))));
        let blank = || Ok(OsString::from("  "));
        assert!(matches!(identity(None, blank), Err(Error::Identity(_))));
    }

    #[tokio::test]
    async fn test_ready_only_while_leading() {
        let (ready, mut rx) = watch::channel(false);
        let leading = CancellationToken::new();
        let app = crate::http::router(Arc::new(crate::http::State::new(rx.clone())));

        let tracker = {
            let leading = leading.clone();
            tokio::spawn(async move { ready_while_leading(&ready, &leading).await })
        };
        rx.wait_for(|r| *r).await.unwrap();
        assert_eq!(readyz(app.clone()).await, StatusCode::OK);

        leading.cancel();
        tracker.await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert_eq!(readyz(app).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn readyz(app: axum::Router) -> StatusCode {
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        app.oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_explicit_lease_namespace_wins() {
        let args = run_args(&["--leader-election-namespace", "cosi-system"]);
        assert_eq!(lease_namespace(&args).await, "cosi-system");
    }

    #[test]
    fn test_lock_name_from_driver_name() {
        assert_eq!(
            sanitize_lock_name("sample.objectstorage.k8s.io/cosi"),
            "sample-objectstorage-k8s-io-cosi"
        );
    }
}
