use std::sync::Arc;
use std::time::Duration;

use mrpc::*;
use tracing_subscriber::EnvFilter;
use user_model::*;

/// Usage: client_user [addr] [config.json]
///
/// Calls a server started by `server_user`. The optional file holds an `Opt`,
/// e.g. `{"serialize_type": "MsgPack", "compress_type": "Gzip"}`.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:8972".to_owned());
    let opt: Opt = match args.next() {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Opt::default(),
    };

    let client = Arc::new(Client::with_interceptors(&addr, opt, &[logging_interceptor("client")])?);
    let users = UserServiceClient::new(client.clone());

    for id in 1..=4 {
        let ctx = Context::new().with_timeout(Duration::from_secs(1));
        match users.get_by_id(ctx, GetByIdReq { id }).await {
            Ok(reply) => tracing::info!(id, name = %reply.user.name, served_by = %reply.served_by, "received"),
            Err(err) => tracing::warn!(id, %err, "call failed"),
        }
    }

    let reply = users
        .export(Context::new(), ExportReq { ids: vec![1, 2, 9] })
        .await;
    match reply.into_result() {
        Ok(resp) => tracing::info!(exported = resp.users.len(), "export finished"),
        Err(err) => tracing::warn!(%err, "export failed"),
    }

    let ctx = Context::new().with_timeout(Duration::from_millis(200));
    if let Err(err) = users.sleep(ctx, SleepReq { millis: 1_000 }).await {
        tracing::info!(%err, "slow call gave up at its deadline");
    }

    client.close();
    Ok(())
}
