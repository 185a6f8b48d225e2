use std::sync::Arc;

use cosi_provisioner::Provisioner;
use kube::Resource;
use kube::runtime::events::EventType;

use crate::events::EventPublisher;
use crate::store::ResourceStore;

/// Everything a listener needs, handed over at construction.
pub struct Dependencies<S> {
    pub store: Arc<S>,
    pub provisioner: Arc<dyn Provisioner>,
    pub events: Arc<dyn EventPublisher>,
    /// Name reported by the driver, matched against class driver names
    pub driver_name: String,
}

impl<S> Clone for Dependencies<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            provisioner: self.provisioner.clone(),
            events: self.events.clone(),
            driver_name: self.driver_name.clone(),
        }
    }
}

impl<S: ResourceStore> Dependencies<S> {
    pub fn new(
        store: Arc<S>,
        provisioner: Arc<dyn Provisioner>,
        events: Arc<dyn EventPublisher>,
        driver_name: &str,
    ) -> Self {
        Self {
            store,
            provisioner,
            events,
            driver_name: driver_name.to_string(),
        }
    }

    /// Driver names compare case-insensitively.
    pub fn owns(&self, driver_name: &str) -> bool {
        driver_name.eq_ignore_ascii_case(&self.driver_name)
    }

    pub async fn warn<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Warning, reason, action, Some(note))
            .await;
    }

    pub async fn normal<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()> + Sync,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Normal, reason, action, Some(note))
            .await;
    }
}
