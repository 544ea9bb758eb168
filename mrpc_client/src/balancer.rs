use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use mrpc_protocol::{Error, Result};
use mrpc_registry::ServiceInstance;
use tracing::{info, warn};

use crate::client::Opt;
use crate::selector::{Endpoint, PickInfo, PickResult, Picker, PickerBuilder};

/// Receives the full instance set of a service whenever it changes.
pub trait StateSink: Send + Sync {
    fn update_state(&self, instances: Vec<ServiceInstance>) -> Result<()>;
    fn report_error(&self, err: Error);
}

struct Snapshot {
    ready: Vec<Arc<Endpoint>>,
    picker: Arc<dyn Picker>,
}

/// Keeps the ready endpoints of one service and the picker over them.
///
/// Every update builds a new snapshot and swaps it in whole; a pick in flight
/// keeps using the snapshot it started with.
pub struct Balancer {
    service_name: String,
    opt: Opt,
    builder: Box<dyn PickerBuilder>,
    snapshot: RwLock<Arc<Snapshot>>,
    last_error: Mutex<Option<Error>>,
}

impl Balancer {
    pub fn new(service_name: &str, opt: Opt, builder: Box<dyn PickerBuilder>) -> Balancer {
        let picker = builder.build(Vec::new());
        Balancer {
            service_name: service_name.to_owned(),
            opt,
            builder,
            snapshot: RwLock::new(Arc::new(Snapshot {
                ready: Vec::new(),
                picker,
            })),
            last_error: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        self.snapshot().picker.pick(info)
    }

    pub fn ready(&self) -> Vec<Arc<Endpoint>> {
        self.snapshot().ready.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.snapshot()
            .ready
            .iter()
            .map(|e| e.address().to_owned())
            .collect()
    }

    /// The latest resolution failure, cleared by the next successful update.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn close(&self) {
        for endpoint in &self.snapshot().ready {
            endpoint.pool.close();
        }
    }
}

impl StateSink for Balancer {
    fn update_state(&self, instances: Vec<ServiceInstance>) -> Result<()> {
        let current = self.snapshot();
        let mut known: HashMap<&str, &Arc<Endpoint>> = current
            .ready
            .iter()
            .map(|e| (e.address(), e))
            .collect();

        let mut ready: Vec<Arc<Endpoint>> = Vec::with_capacity(instances.len());
        for si in instances {
            if ready.iter().any(|e| e.address() == si.address) {
                continue;
            }
            let endpoint = match known.remove(si.address.as_str()) {
                Some(old) if old.instance == si => old.clone(),
                Some(old) => Arc::new(Endpoint::with_pool(si, old.pool.clone())),
                None => Arc::new(Endpoint::new(si, &self.opt)?),
            };
            ready.push(endpoint);
        }
        for gone in known.values() {
            gone.pool.close();
        }

        let picker = self.builder.build(ready.clone());
        info!(service = %self.service_name, ready = ready.len(), "ready set updated");
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Snapshot { ready, picker });
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn report_error(&self, err: Error) {
        warn!(service = %self.service_name, %err, "resolution failed, keeping the previous ready set");
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{Builder, SelectMode};
    use mrpc_protocol::{Context, ErrorKind};

    fn balancer() -> Balancer {
        Balancer::new(
            "user-service",
            Opt::default(),
            Box::new(Builder::new(SelectMode::RoundRobin)),
        )
    }

    #[tokio::test]
    async fn empty_until_updated() {
        let b = balancer();
        let ctx = Context::new();
        let info = PickInfo {
            service_name: "user-service",
            method: "GetById",
            ctx: &ctx,
        };
        assert_eq!(
            ErrorKind::NoConnectionAvailable,
            b.pick(&info).unwrap_err().kind()
        );

        b.update_state(vec![ServiceInstance::new("user-service", "127.0.0.1:9001")])
            .unwrap();
        assert_eq!("127.0.0.1:9001", b.pick(&info).unwrap().endpoint.address());
    }

    #[tokio::test]
    async fn surviving_endpoints_are_reused() {
        let b = balancer();
        let a = ServiceInstance::new("user-service", "127.0.0.1:9001");
        let c = ServiceInstance::new("user-service", "127.0.0.1:9002");
        b.update_state(vec![a.clone(), c.clone()]).unwrap();
        let before = b.ready();

        b.update_state(vec![a.clone(), c.clone().with_weight(5)]).unwrap();
        let after = b.ready();
        assert!(Arc::ptr_eq(&before[0], &after[0]));
        assert!(!Arc::ptr_eq(&before[1], &after[1]));
        assert_eq!(Some(5), after[1].instance.weight);

        b.update_state(vec![c.clone(), c]).unwrap();
        assert_eq!(vec!["127.0.0.1:9002".to_owned()], b.addresses());
    }

    #[tokio::test]
    async fn errors_keep_the_previous_set() {
        let b = balancer();
        b.update_state(vec![ServiceInstance::new("user-service", "127.0.0.1:9001")])
            .unwrap();
        b.report_error(Error::new(ErrorKind::Registry, "store unreachable"));
        assert_eq!(1, b.addresses().len());
        assert_eq!(ErrorKind::Registry, b.last_error().unwrap().kind());
    }
}
