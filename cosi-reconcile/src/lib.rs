pub mod engine;
pub mod leader;
pub mod lock;
pub mod metrics;
pub mod op;
pub mod pending;
pub mod queue;
pub mod rate_limiter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use engine::{Engine, EngineConfig, run_for};
pub use leader::{
    KubeLeaseLock, LeaderElectionConfig, LeaderElector, LeaderState, LeaseLock, sanitize_lock_name,
};
pub use lock::LockRegistry;
pub use op::Op;
pub use queue::WorkQueue;
pub use rate_limiter::ExponentialBackoff;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("cannot add object {key}: an update for it is already pending")]
    AddConflict { key: String },

    #[error("lease {name} has no resourceVersion")]
    LeaseMissingVersion { name: String },

    #[error("leadership of {lock} lost")]
    LeadershipLost { lock: String },

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification the engine needs from listener errors.
pub trait ReconcileError: std::error::Error + Send + Sync + 'static {
    /// The object is waiting on another object rather than failing.
    fn is_waiting(&self) -> bool {
        false
    }

    /// Low cardinality label for failure counters.
    fn metric_label(&self) -> String;
}

/// Callbacks for one resource kind. Every callback must be idempotent:
/// failed ops are retried with backoff until they succeed.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;
    type Error: ReconcileError;

    async fn add(&self, obj: Arc<Self::Resource>) -> Result<(), Self::Error>;

    async fn update(
        &self,
        old: Arc<Self::Resource>,
        new: Arc<Self::Resource>,
    ) -> Result<(), Self::Error>;

    async fn delete(&self, obj: Arc<Self::Resource>) -> Result<(), Self::Error>;
}
