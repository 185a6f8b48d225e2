use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cosi_reconcile::EngineConfig;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the provisioning controller for the driver at --driver-address
    Run(RunArgs),
    /// Print the CRDs as YAML
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Provisioner endpoint of the driver, unix:// only
    #[arg(long, env = "DRIVER_ADDRESS", default_value = "unix:///var/lib/cosi/cosi.sock")]
    pub driver_address: String,

    /// Kubeconfig to use instead of in-cluster inference
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Workers per resource kind
    #[arg(long, env = "WORKER_THREADS", default_value_t = cosi_reconcile::engine::DEFAULT_WORKERS)]
    pub threads: usize,

    /// Leader election identity, defaults to the host name
    #[arg(long, env = "POD_NAME")]
    pub identity: Option<String>,

    /// Namespace of the leader election lease
    #[arg(long, env = "POD_NAMESPACE")]
    pub leader_election_namespace: Option<String>,

    /// Lease duration in seconds
    #[arg(long, default_value_t = 150)]
    pub lease_duration: u64,

    /// Renew deadline in seconds
    #[arg(long, default_value_t = 120)]
    pub renew_deadline: u64,

    /// Leader election retry period in seconds
    #[arg(long, default_value_t = 60)]
    pub retry_period: u64,

    /// First retry delay of a failed op in milliseconds
    #[arg(long, default_value_t = 100)]
    pub base_delay_ms: u64,

    /// Ceiling of the retry delay in seconds
    #[arg(long, default_value_t = 30)]
    pub max_delay_secs: u64,

    /// Period in seconds of re-checking every watched object, 0 disables it
    #[arg(long, default_value_t = 30)]
    pub resync_secs: u64,

    /// Metrics and readiness listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Apply the CRDs on startup
    #[arg(long)]
    pub install_crds: bool,

    /// Log every driver request and response
    #[arg(long)]
    pub debug: bool,
}

impl RunArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.threads,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            resync: Some(Duration::from_secs(self.resync_secs)).filter(|p| !p.is_zero()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        let mut argv = vec!["cosi-controller", "run"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Run(args) => args,
            Commands::Crdgen => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let args = parse(&[]);
        assert_eq!(args.driver_address, "unix:///var/lib/cosi/cosi.sock");
        assert_eq!(args.lease_duration, 150);
        assert_eq!(args.renew_deadline, 120);
        assert_eq!(args.retry_period, 60);
        assert!(!args.install_crds);
        let engine = args.engine_config();
        assert_eq!(engine.base_delay, Duration::from_millis(100));
        assert_eq!(engine.max_delay, Duration::from_secs(30));
        assert_eq!(engine.resync, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_resync_disables_it() {
        assert_eq!(parse(&["--resync-secs", "0"]).engine_config().resync, None);
    }

    #[test]
    fn test_run_overrides() {
        let args = parse(&[
            "--driver-address",
            "unix:///tmp/driver.sock",
            "--threads",
            "4",
            "--identity",
            "controller-0",
            "--install-crds",
            "--debug",
        ]);
        assert_eq!(args.driver_address, "unix:///tmp/driver.sock");
        assert_eq!(args.engine_config().workers, 4);
        assert_eq!(args.identity.as_deref(), Some("controller-0"));
        assert!(args.install_crds && args.debug);
    }

    #[test]
    fn test_crdgen_subcommand() {
        let cli = Cli::try_parse_from(["cosi-controller", "crdgen"]).unwrap();
        assert!(matches!(cli.command, Commands::Crdgen));
    }
}
