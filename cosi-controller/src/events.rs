//! Kubernetes Events recorded against the objects being reconciled.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! the op that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller` is reported as the Event's reportingComponent.
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

pub mod reasons {
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    pub const BUCKET_DELETE_FAILED: &str = "BucketDeleteFailed";
    pub const GRANTING_ACCESS_FAILED: &str = "GrantingAccessFailed";
    pub const REVOKING_ACCESS_FAILED: &str = "RevokingAccessFailed";
    pub const WAITING_FOR_BUCKET: &str = "WaitingForBucket";
    /// A class that no driver can serve.
    pub const INVALID_CLASS: &str = "InvalidClass";
}

pub mod actions {
    pub const PROVISION: &str = "Provision";
    pub const DELETE: &str = "Delete";
    pub const GRANT: &str = "Grant";
    pub const REVOKE: &str = "Revoke";
    pub const VALIDATE: &str = "Validate";
}
