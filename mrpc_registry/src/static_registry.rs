use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use mrpc_protocol::{Error, ErrorKind, Result};
use tokio::sync::mpsc;

use crate::registry::{Event, EventType, Registry, ServiceInstance};

#[derive(Default)]
struct State {
    instances: Vec<ServiceInstance>,
    subscribers: Vec<(String, mpsc::UnboundedSender<Event>)>,
}

/// A registry over a fixed, manually updated instance list.
#[derive(Default)]
pub struct StaticRegistry {
    state: Mutex<State>,
}

impl StaticRegistry {
    pub fn new(instances: Vec<ServiceInstance>) -> StaticRegistry {
        StaticRegistry {
            state: Mutex::new(State {
                instances,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::new(ErrorKind::Registry, "static registry poisoned"))
    }

    /// Replaces the instance list, emitting Delete for vanished instances and
    /// Add for new or changed ones.
    pub fn update(&self, instances: Vec<ServiceInstance>) -> Result<()> {
        let mut state = self.lock()?;
        let mut events = Vec::new();
        for old in &state.instances {
            if !instances.iter().any(|si| si.same_identity(old)) {
                events.push(Event {
                    event_type: EventType::Delete,
                    instance: old.clone(),
                });
            }
        }
        for si in &instances {
            if !state.instances.contains(si) {
                events.push(Event {
                    event_type: EventType::Add,
                    instance: si.clone(),
                });
            }
        }
        state.instances = instances;
        for ev in events {
            notify(&mut state, ev);
        }
        Ok(())
    }
}

fn notify(state: &mut State, ev: Event) {
    state
        .subscribers
        .retain(|(name, tx)| *name != ev.instance.name || tx.send(ev.clone()).is_ok());
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register(&self, si: &ServiceInstance) -> Result<()> {
        let mut state = self.lock()?;
        state.instances.retain(|old| !old.same_identity(si));
        state.instances.push(si.clone());
        notify(
            &mut state,
            Event {
                event_type: EventType::Add,
                instance: si.clone(),
            },
        );
        Ok(())
    }

    async fn unregister(&self, si: &ServiceInstance) -> Result<()> {
        let mut state = self.lock()?;
        let before = state.instances.len();
        state.instances.retain(|old| !old.same_identity(si));
        if state.instances.len() != before {
            notify(
                &mut state,
                Event {
                    event_type: EventType::Delete,
                    instance: si.clone(),
                },
            );
        }
        Ok(())
    }

    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let state = self.lock()?;
        Ok(state
            .instances
            .iter()
            .filter(|si| si.name == name)
            .cloned()
            .collect())
    }

    async fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<Event>> {
        let (utx, mut urx) = mpsc::unbounded_channel();
        self.lock()?.subscribers.push((name.to_owned(), utx));

        // bounded at the edge like every other registry
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(ev) = urx.recv().await {
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.lock()?.subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_emits_diff() {
        let a = ServiceInstance::new("s", "a:1");
        let b = ServiceInstance::new("s", "b:1");
        let c = ServiceInstance::new("s", "c:1");
        let registry = StaticRegistry::new(vec![a.clone(), b.clone()]);
        let mut events = registry.subscribe("s").await.unwrap();

        registry.update(vec![b.clone(), c.clone()]).unwrap();
        assert_eq!(
            Event {
                event_type: EventType::Delete,
                instance: a
            },
            events.recv().await.unwrap()
        );
        assert_eq!(
            Event {
                event_type: EventType::Add,
                instance: c
            },
            events.recv().await.unwrap()
        );
        assert_eq!(2, registry.list_services("s").await.unwrap().len());

        registry.close().await.unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscription_is_per_name() {
        let registry = StaticRegistry::default();
        let mut events = registry.subscribe("s").await.unwrap();
        registry
            .register(&ServiceInstance::new("other", "x:1"))
            .await
            .unwrap();
        registry.register(&ServiceInstance::new("s", "y:1")).await.unwrap();
        assert_eq!("y:1", events.recv().await.unwrap().instance.address);
    }
}
