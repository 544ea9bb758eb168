use std::sync::Arc;

use mrpc::*;
use tracing_subscriber::EnvFilter;
use user_model::*;

/// Usage: client_broadcast [config.json]
///
/// Starts three user-service instances registered in an in-process store,
/// one of them broken, then calls them through a registry-backed client.
/// The optional file holds the client `Opt`.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt: Opt = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Opt::default(),
    };

    let store = MemoryStore::new();
    let mut servers = Vec::new();
    for (i, broken) in [false, false, true].into_iter().enumerate() {
        let registry: Arc<dyn Registry> = Arc::new(StoreRegistry::new(store.clone()).await?);
        let users = UserStore::new(&format!("instance-{}", i));
        let users = if broken { users.broken() } else { users };

        let mut server = Server::new(ServerOpt {
            addr: "127.0.0.1:0".to_owned(),
            ..Default::default()
        });
        server.register(Arc::new(users).into_service())?;
        server.add_register_plugin(Arc::new(RegistryPlugin::new(registry)));
        servers.push(server.start().await?);
    }

    let registry: Arc<dyn Registry> = Arc::new(StoreRegistry::new(store.clone()).await?);
    let xclient = Arc::new(
        XClient::builder(UserServiceClient::SERVICE_NAME, registry)
            .opt(opt)
            .interceptor(logging_interceptor("client"))
            .build()
            .await?,
    );
    tracing::info!(ready = ?xclient.balancer().addresses(), "resolved");

    let users = UserServiceClient::new(xclient.clone());
    for _ in 0..3 {
        match users.get_by_id(Context::new(), GetByIdReq { id: 1 }).await {
            Ok(reply) => tracing::info!(served_by = %reply.served_by, "unary"),
            Err(err) => tracing::warn!(%err, "unary failed"),
        }
    }

    let fastest = users.clone().with_mode(CallMode::BroadcastFastest);
    match fastest.get_by_id(Context::new(), GetByIdReq { id: 2 }).await {
        Ok(reply) => tracing::info!(served_by = %reply.served_by, "fastest"),
        Err(err) => tracing::warn!(%err, "every instance failed"),
    }

    let replies = users
        .stub()
        .broadcast_all::<_, UserReply>(Context::new(), "GetById", &GetByIdReq { id: 3 })
        .await?
        .collect()
        .await;
    for (address, result) in replies {
        match result {
            Ok(reply) => tracing::info!(%address, name = %reply.user.name, "broadcast reply"),
            Err(err) => tracing::warn!(%address, %err, "broadcast reply"),
        }
    }

    xclient.close();
    for server in servers {
        server.close().await?;
    }
    Ok(())
}
