use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mrpc_protocol::{Error, ErrorKind, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{LeaseId, Store, WatchEvent};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

/// An in-process coordinated store: ordered keys, TTL leases and prefix watches.
///
/// Events are published while the state lock is held, so every watcher sees
/// changes in store order.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    /// Must be called inside a tokio runtime; a sweeper task expires leases
    /// until the store is dropped.
    pub fn new() -> Arc<MemoryStore> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Arc::new(MemoryStore {
            inner: Mutex::new(Inner::default()),
            events,
        });

        let weak: Weak<MemoryStore> = Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => store.expire_leases(),
                    None => return,
                }
            }
        });
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::new(ErrorKind::Registry, "memory store poisoned"))
    }

    fn publish(&self, ev: WatchEvent) {
        // no receivers is fine
        let _ = self.events.send(ev);
    }

    fn remove_lease_keys(&self, inner: &mut Inner, lease: LeaseId) {
        let keys: Vec<String> = inner
            .kvs
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            inner.kvs.remove(&key);
            self.publish(WatchEvent::Delete { key });
        }
    }

    fn expire_leases(&self) {
        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(err) => {
                warn!(%err, "skipping lease sweep");
                return;
            }
        };
        let now = Instant::now();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease, "lease expired");
            inner.leases.remove(&lease);
            self.remove_lease_keys(&mut inner, lease);
        }
    }
}

fn no_lease(lease: LeaseId) -> Error {
    Error::new(ErrorKind::Registry, format!("lease {} not found", lease))
}

#[async_trait]
impl Store for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(Error::new(ErrorKind::Config, "lease ttl must be positive"));
        }
        let mut inner = self.lock()?;
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        let l = inner.leases.get_mut(&lease).ok_or_else(|| no_lease(lease))?;
        l.expires_at = Instant::now() + l.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.leases.remove(&lease).is_none() {
            return Err(no_lease(lease));
        }
        self.remove_lease_keys(&mut inner, lease);
        Ok(())
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(lease) = lease {
            if !inner.leases.contains_key(&lease) {
                return Err(no_lease(lease));
            }
        }
        inner.kvs.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        self.publish(WatchEvent::Put {
            key: key.to_owned(),
            value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.kvs.remove(key).is_some() {
            self.publish(WatchEvent::Delete {
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let inner = self.lock()?;
        Ok(inner
            .kvs
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let prefix = prefix.to_owned();
        tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = events.recv() => ev,
                };
                match ev {
                    Ok(ev) if ev.key().starts_with(&prefix) => {
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%prefix, skipped = n, "watcher fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%prefix, "watch stopped");
        });
        Ok(rx)
    }
}
