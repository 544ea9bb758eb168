use std::sync::Arc;

use mrpc::*;
use tracing_subscriber::EnvFilter;
use user_model::{UserService, UserStore};

/// Usage: server_user [config.json]
///
/// The optional file holds a `ServerOpt`, e.g. `{"addr": "0.0.0.0:8972"}`.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt: ServerOpt = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ServerOpt {
            addr: "127.0.0.1:8972".to_owned(),
            ..Default::default()
        },
    };

    let mut server = Server::new(opt);
    server.register(Arc::new(UserStore::new("server_user")).into_service())?;
    server.add_interceptor(logging_interceptor("server"));
    let running = server.start().await?;
    tracing::info!(addr = %running.local_addr(), "serving user-service, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    running.close().await
}
