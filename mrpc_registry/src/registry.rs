use async_trait::async_trait;
use mrpc_protocol::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::sync::mpsc;

/// One running, addressable process serving a named service.
///
/// Identity is `(name, address)`; weight and group only steer balancing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl ServiceInstance {
    pub fn new(name: &str, address: &str) -> ServiceInstance {
        ServiceInstance {
            name: name.to_owned(),
            address: address.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_owned());
        self
    }

    /// Instances registered without a weight count as weight 1.
    pub fn weight_or_default(&self) -> u32 {
        self.weight.unwrap_or(1)
    }

    pub fn same_identity(&self, other: &ServiceInstance) -> bool {
        self.name == other.name && self.address == other.address
    }
}

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumString)]
pub enum EventType {
    Unknown,
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub instance: ServiceInstance,
}

/// The client and server view of a service registry.
///
/// `register` must only be called once the instance is accepting
/// connections, and `unregister` must finish before its listener closes.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, si: &ServiceInstance) -> Result<()>;
    async fn unregister(&self, si: &ServiceInstance) -> Result<()>;
    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>>;
    /// Events for `name` in the order the backing store produced them.
    async fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<Event>>;
    /// Stops every subscription created through this registry.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_json() {
        let si = ServiceInstance::new("user-service", "127.0.0.1:8081").with_weight(3);
        let json = serde_json::to_string(&si).unwrap();
        assert_eq!(
            r#"{"name":"user-service","address":"127.0.0.1:8081","weight":3}"#,
            json
        );
        let back: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(si, back);
        assert_eq!(3, back.weight_or_default());
        assert_eq!(1, ServiceInstance::default().weight_or_default());
    }

    #[test]
    fn identity() {
        let a = ServiceInstance::new("s", "a:1").with_weight(1);
        let b = ServiceInstance::new("s", "a:1").with_group("canary");
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&ServiceInstance::new("s", "a:2")));
    }
}
