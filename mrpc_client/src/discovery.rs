use std::sync::Arc;
use std::time::Duration;

use mrpc_protocol::{Error, ErrorKind, Result};
use mrpc_registry::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::balancer::StateSink;

/// Feeds a registry's view of one service into a [`StateSink`].
///
/// Any event triggers a full re-list rather than patching the set, so the
/// sink always holds exactly what the registry returned last.
pub struct Resolver {
    cancel: CancellationToken,
    refresh: mpsc::Sender<()>,
}

impl Resolver {
    pub async fn build(
        registry: Arc<dyn Registry>,
        service_name: &str,
        sink: Arc<dyn StateSink>,
        timeout: Duration,
    ) -> Result<Resolver> {
        // subscribe first so no change between the list and the watch is lost
        let mut events = registry.subscribe(service_name).await?;
        resolve(registry.as_ref(), service_name, sink.as_ref(), timeout).await;

        let cancel = CancellationToken::new();
        let (refresh, mut refresh_rx) = mpsc::channel(1);
        let watch_cancel = cancel.clone();
        let name = service_name.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watch_cancel.cancelled() => break,
                    ev = events.recv() => match ev {
                        Some(ev) => {
                            debug!(service = %name, event = %ev.event_type, address = %ev.instance.address, "registry event");
                        }
                        None => {
                            sink.report_error(Error::new(ErrorKind::Registry, "registry subscription closed"));
                            break;
                        }
                    },
                    Some(()) = refresh_rx.recv() => {}
                }
                resolve(registry.as_ref(), &name, sink.as_ref(), timeout).await;
            }
            debug!(service = %name, "resolver stopped");
        });

        Ok(Resolver { cancel, refresh })
    }

    /// Asks for a re-list; coalesces with one already pending.
    pub fn resolve_now(&self) {
        let _ = self.refresh.try_send(());
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn resolve(registry: &dyn Registry, name: &str, sink: &dyn StateSink, timeout: Duration) {
    let res = match tokio::time::timeout(timeout, registry.list_services(name)).await {
        Ok(res) => res,
        Err(_) => Err(Error::new(
            ErrorKind::Timeout,
            format!("listing {} took longer than {:?}", name, timeout),
        )),
    };
    match res.and_then(|instances| sink.update_state(instances)) {
        Ok(()) => {}
        Err(err) => sink.report_error(err),
    }
}
