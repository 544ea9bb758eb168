use std::time::Duration;

use async_trait::async_trait;
use mrpc_protocol::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::connection::{call_pool, dial_pool, TcpConnection};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::selector::SelectMode;
use crate::{CallMode, Dispatched, InstanceReply, Invoker};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Opt {
    #[serde(with = "by_name")]
    pub serialize_type: SerializeType,
    #[serde(with = "by_name")]
    pub compress_type: CompressType,
    /// Zero leaves connecting to the operating system.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub nodelay: Option<bool>,
    pub pool: PoolConfig,
    #[serde(with = "by_name")]
    pub select_mode: SelectMode,
    /// Bound on one registry lookup of the resolver.
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            serialize_type: SerializeType::JSON,
            compress_type: CompressType::CompressNone,
            connect_timeout: Duration::from_secs(3),
            nodelay: Some(true),
            pool: PoolConfig::default(),
            select_mode: SelectMode::RoundRobin,
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

/// Enums written as their variant names.
mod by_name {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &T, s: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        s.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let name = String::deserialize(d)?;
        name.parse().map_err(de::Error::custom)
    }
}

/// a direct client to one mrpc server address.
pub struct Client {
    pub opt: Opt,
    addr: String,
    pool: ConnectionPool<TcpConnection>,
    handler: Handler,
}

impl Client {
    pub fn new(addr: &str, opt: Opt) -> Result<Client> {
        Client::with_interceptors(addr, opt, &[])
    }

    pub fn with_interceptors(addr: &str, opt: Opt, interceptors: &[Interceptor]) -> Result<Client> {
        let pool = dial_pool(addr, &opt)?;
        let terminal_pool = pool.clone();
        let terminal = handler(move |ctx: Context, req: Request| {
            let pool = terminal_pool.clone();
            async move { call_pool(&pool, &ctx, req).await }
        });
        Ok(Client {
            opt,
            addr: addr.to_owned(),
            pool,
            handler: chain(interceptors, terminal),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn pool(&self) -> &ConnectionPool<TcpConnection> {
        &self.pool
    }

    pub async fn call(&self, ctx: Context, req: Request) -> Result<Response> {
        (self.handler)(ctx, req).await
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl Invoker for Client {
    async fn dispatch(&self, ctx: Context, req: Request, mode: CallMode) -> Result<Dispatched> {
        let resp = self.call(ctx, req).await;
        match mode {
            CallMode::Unary | CallMode::BroadcastFastest => Ok(Dispatched::Single(resp?)),
            CallMode::BroadcastAll => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx
                    .send(InstanceReply {
                        address: self.addr.clone(),
                        result: resp,
                    })
                    .await;
                Ok(Dispatched::Stream(rx))
            }
        }
    }

    fn serialize_type(&self) -> SerializeType {
        self.opt.serialize_type
    }

    fn compress_type(&self) -> CompressType {
        self.opt.compress_type
    }
}
