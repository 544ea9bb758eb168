use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mrpc_protocol::{Error, ErrorKind, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::{Event, EventType, Registry, ServiceInstance};

pub type LeaseId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// A coordinated key-value store with leases and prefix watches.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;
    /// Drops the lease and every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;
    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
    /// Changes under `prefix` until `cancel` fires.
    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchEvent>>;
}

pub const DEFAULT_PREFIX: &str = "/micro";
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// The lease is renewed every third of its ttl; shorter ttls are refused.
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// A [`Registry`] over any [`Store`].
///
/// Instances live at `/micro/{name}/{address}` as JSON and are attached to one
/// session lease kept alive in the background. Closing revokes that lease and
/// cancels the watches created here; the store itself is left open since it
/// may be shared.
pub struct StoreRegistry<S: Store> {
    store: Arc<S>,
    prefix: String,
    lease: LeaseId,
    session: CancellationToken,
    watches: Mutex<Vec<CancellationToken>>,
}

impl<S: Store> StoreRegistry<S> {
    pub async fn new(store: Arc<S>) -> Result<StoreRegistry<S>> {
        Self::with_ttl(store, DEFAULT_TTL).await
    }

    pub async fn with_ttl(store: Arc<S>, ttl: Duration) -> Result<StoreRegistry<S>> {
        if ttl < MIN_TTL {
            return Err(Error::new(
                ErrorKind::Config,
                format!("registry ttl {:?} is below {:?}", ttl, MIN_TTL),
            ));
        }
        let lease = store.grant_lease(ttl).await?;
        let session = CancellationToken::new();

        let keep_alive_store = store.clone();
        let keep_alive_session = session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl / 3);
            loop {
                tokio::select! {
                    _ = keep_alive_session.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = keep_alive_store.keep_alive(lease).await {
                            warn!(lease, %err, "failed to keep the registry lease alive");
                        }
                    }
                }
            }
        });

        Ok(StoreRegistry {
            store,
            prefix: DEFAULT_PREFIX.to_owned(),
            lease,
            session,
            watches: Mutex::new(Vec::new()),
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    fn instance_key(&self, si: &ServiceInstance) -> String {
        format!("{}/{}/{}", self.prefix, si.name, si.address)
    }

    fn service_key(&self, name: &str) -> String {
        format!("{}/{}/", self.prefix, name)
    }
}

fn to_event(service_key: &str, name: &str, ev: WatchEvent) -> Event {
    match ev {
        WatchEvent::Put { value, .. } => match serde_json::from_str(&value) {
            Ok(instance) => Event {
                event_type: EventType::Add,
                instance,
            },
            Err(_) => Event {
                event_type: EventType::Unknown,
                instance: ServiceInstance::new(name, ""),
            },
        },
        WatchEvent::Delete { key } => Event {
            event_type: EventType::Delete,
            instance: ServiceInstance::new(name, key.strip_prefix(service_key).unwrap_or(&key)),
        },
    }
}

#[async_trait]
impl<S: Store> Registry for StoreRegistry<S> {
    async fn register(&self, si: &ServiceInstance) -> Result<()> {
        let value = serde_json::to_string(si)?;
        self.store
            .put(&self.instance_key(si), value, Some(self.lease))
            .await
    }

    async fn unregister(&self, si: &ServiceInstance) -> Result<()> {
        self.store.delete(&self.instance_key(si)).await
    }

    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let kvs = self.store.get_prefix(&self.service_key(name)).await?;
        kvs.into_iter()
            .map(|(key, value)| {
                serde_json::from_str(&value).map_err(|err| {
                    Error::new(ErrorKind::Registry, format!("bad instance at {}: {}", key, err))
                })
            })
            .collect()
    }

    async fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<Event>> {
        let cancel = self.session.child_token();
        {
            let mut watches = self
                .watches
                .lock()
                .map_err(|_| Error::new(ErrorKind::Registry, "watch list poisoned"))?;
            // finished subscriptions cancel their own token
            watches.retain(|w| !w.is_cancelled());
            watches.push(cancel.clone());
        }

        let service_key = self.service_key(name);
        let mut changes = self.store.watch_prefix(&service_key, cancel.clone()).await?;
        let (tx, rx) = mpsc::channel(64);
        let name = name.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    change = changes.recv() => match change {
                        Some(change) => {
                            if tx.send(to_event(&service_key, &name, change)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            cancel.cancel();
            debug!(service = %name, "registry subscription finished");
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let watches = std::mem::take(
            &mut *self
                .watches
                .lock()
                .map_err(|_| Error::new(ErrorKind::Registry, "watch list poisoned"))?,
        );
        for cancel in watches {
            cancel.cancel();
        }
        self.session.cancel();
        self.store.revoke(self.lease).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn register_list_unregister() {
        let store = MemoryStore::new();
        let registry = StoreRegistry::new(store.clone()).await.unwrap();
        let a = ServiceInstance::new("user-service", "127.0.0.1:8081").with_weight(1);
        let b = ServiceInstance::new("user-service", "127.0.0.1:8082").with_weight(3);
        let other = ServiceInstance::new("user-service-v2", "127.0.0.1:9000");

        registry.register(&a).await.unwrap();
        registry.register(&b).await.unwrap();
        registry.register(&other).await.unwrap();

        let listed = registry.list_services("user-service").await.unwrap();
        assert_eq!(vec![a.clone(), b.clone()], listed);

        registry.unregister(&a).await.unwrap();
        let listed = registry.list_services("user-service").await.unwrap();
        assert_eq!(vec![b], listed);
    }

    #[tokio::test]
    async fn subscribe_sees_add_and_delete() {
        let store = MemoryStore::new();
        let registry = StoreRegistry::new(store.clone()).await.unwrap();
        let mut events = registry.subscribe("user-service").await.unwrap();

        let si = ServiceInstance::new("user-service", "127.0.0.1:8081");
        registry.register(&si).await.unwrap();
        registry.unregister(&si).await.unwrap();

        let ev = events.recv().await.unwrap();
        assert_eq!(EventType::Add, ev.event_type);
        assert_eq!(si, ev.instance);

        let ev = events.recv().await.unwrap();
        assert_eq!(EventType::Delete, ev.event_type);
        assert!(si.same_identity(&ev.instance));
    }

    #[tokio::test]
    async fn tiny_ttl_is_rejected() {
        let store = MemoryStore::new();
        for ttl in [Duration::ZERO, Duration::from_nanos(2)] {
            let err = StoreRegistry::with_ttl(store.clone(), ttl).await.err().unwrap();
            assert_eq!(ErrorKind::Config, err.kind());
        }
        assert!(StoreRegistry::with_ttl(store, MIN_TTL).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_forgotten() {
        let store = MemoryStore::new();
        let registry = StoreRegistry::new(store).await.unwrap();
        for _ in 0..3 {
            drop(registry.subscribe("user-service").await.unwrap());
        }
        let finished = || registry.watches.lock().unwrap().iter().all(|w| w.is_cancelled());
        while !finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let _live = registry.subscribe("user-service").await.unwrap();
        assert_eq!(1, registry.watches.lock().unwrap().len());
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_cancels_watches_and_revokes_lease() {
        let store = MemoryStore::new();
        let server_side = StoreRegistry::new(store.clone()).await.unwrap();
        let client_side = StoreRegistry::new(store.clone()).await.unwrap();
        server_side
            .register(&ServiceInstance::new("user-service", "127.0.0.1:8081"))
            .await
            .unwrap();

        let mut events = client_side.subscribe("user-service").await.unwrap();
        client_side.close().await.unwrap();
        assert!(events.recv().await.is_none());

        // the store stays usable for other registries
        assert_eq!(1, server_side.list_services("user-service").await.unwrap().len());
        server_side.close().await.unwrap();
        assert!(store.get_prefix("/micro/").await.unwrap().is_empty());
    }
}
