use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mrpc_protocol::*;
use mrpc_registry::{Registry, ServiceInstance};
use tracing::info;

use crate::{Server, ServerOpt};

impl Server {
    pub fn add_register_plugin(&mut self, p: Arc<dyn RegisterPlugin>) {
        self.register_plugins.push(p);
    }

    pub fn add_connect_plugin(&mut self, p: Arc<dyn ConnectPlugin>) {
        self.connect_plugins.push(p);
    }
}

/// Announces the services of a running server, and withdraws them on close.
#[async_trait]
pub trait RegisterPlugin: Send + Sync {
    async fn register(&self, service_name: &str, addr: &str) -> Result<()>;
    async fn unregister(&self, service_name: &str, addr: &str) -> Result<()>;
}

/// Sees every accepted connection before it is served; an error drops it.
pub trait ConnectPlugin: Send + Sync {
    fn connected(&self, peer: SocketAddr) -> Result<()>;
}

/// Registers each service as one instance in a [`Registry`].
pub struct RegistryPlugin {
    registry: Arc<dyn Registry>,
    weight: Option<u32>,
    group: Option<String>,
}

impl RegistryPlugin {
    pub fn new(registry: Arc<dyn Registry>) -> RegistryPlugin {
        RegistryPlugin {
            registry,
            weight: None,
            group: None,
        }
    }

    /// Takes the advertised weight and group from the server options.
    pub fn from_opt(registry: Arc<dyn Registry>, opt: &ServerOpt) -> RegistryPlugin {
        RegistryPlugin {
            registry,
            weight: Some(opt.weight),
            group: opt.group.clone(),
        }
    }

    fn instance(&self, service_name: &str, addr: &str) -> ServiceInstance {
        let mut si = ServiceInstance::new(service_name, addr);
        si.weight = self.weight;
        si.group = self.group.clone();
        si
    }
}

#[async_trait]
impl RegisterPlugin for RegistryPlugin {
    async fn register(&self, service_name: &str, addr: &str) -> Result<()> {
        self.registry
            .register(&self.instance(service_name, addr))
            .await?;
        info!(service = %service_name, %addr, "registered");
        Ok(())
    }

    async fn unregister(&self, service_name: &str, addr: &str) -> Result<()> {
        self.registry
            .unregister(&self.instance(service_name, addr))
            .await?;
        info!(service = %service_name, %addr, "unregistered");
        Ok(())
    }
}

/// Accepts only peers from the given addresses.
pub struct AllowList {
    allowed: Vec<std::net::IpAddr>,
}

impl AllowList {
    pub fn new(allowed: Vec<std::net::IpAddr>) -> AllowList {
        AllowList { allowed }
    }
}

impl ConnectPlugin for AllowList {
    fn connected(&self, peer: SocketAddr) -> Result<()> {
        if self.allowed.contains(&peer.ip()) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Network,
                format!("peer {} is not allowed", peer),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrpc_registry::StaticRegistry;

    #[tokio::test]
    async fn registers_with_weight_and_group() {
        let registry = Arc::new(StaticRegistry::default());
        let opt = ServerOpt {
            weight: 3,
            group: Some("blue".to_owned()),
            ..Default::default()
        };
        let plugin = RegistryPlugin::from_opt(registry.clone(), &opt);
        plugin.register("user-service", "127.0.0.1:9001").await.unwrap();

        let listed = registry.list_services("user-service").await.unwrap();
        assert_eq!(1, listed.len());
        assert_eq!(Some(3), listed[0].weight);
        assert_eq!(Some("blue".to_owned()), listed[0].group);

        plugin.unregister("user-service", "127.0.0.1:9001").await.unwrap();
        assert!(registry.list_services("user-service").await.unwrap().is_empty());
    }

    #[test]
    fn allow_list() {
        let plugin = AllowList::new(vec!["127.0.0.1".parse().unwrap()]);
        assert!(plugin.connected("127.0.0.1:5000".parse().unwrap()).is_ok());
        assert!(plugin.connected("10.0.0.1:5000".parse().unwrap()).is_err());
    }
}
