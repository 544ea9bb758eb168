#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mrpc::*;
use user_model::{UserService, UserStore};

pub fn local_opt() -> ServerOpt {
    ServerOpt {
        addr: "127.0.0.1:0".to_owned(),
        ..Default::default()
    }
}

/// Starts one user-service instance named `instance`, announced through
/// `registry` when given.
pub async fn start_instance(
    instance: &str,
    broken: bool,
    registry: Option<Arc<dyn Registry>>,
) -> RunningServer {
    let users = UserStore::new(instance);
    let users = if broken { users.broken() } else { users };
    let mut server = Server::new(local_opt());
    server.register(Arc::new(users).into_service()).unwrap();
    if let Some(registry) = registry {
        server.add_register_plugin(Arc::new(RegistryPlugin::new(registry)));
    }
    server.start().await.unwrap()
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
