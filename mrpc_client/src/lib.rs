pub mod balancer;
pub mod client;
pub mod connection;
pub mod discovery;
pub mod pool;
pub mod proxy;
pub mod selector;
pub mod xclient;

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use mrpc_protocol::{CompressType, Context, Request, Response, Result, SerializeType};
use strum_macros::{Display, EnumIter, EnumString};
use tokio::sync::mpsc;

pub use balancer::*;
pub use client::*;
pub use connection::*;
pub use discovery::*;
pub use pool::*;
pub use proxy::*;
pub use selector::*;
pub use xclient::*;

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Process-wide request ids; they wrap around after `u32::MAX` calls.
pub fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Copy, Clone, Default, Display, PartialEq, Eq, EnumIter, EnumString)]
pub enum CallMode {
    /// one picked instance.
    #[default]
    Unary,
    /// every ready instance, first successful response wins.
    BroadcastFastest,
    /// every ready instance, every response is streamed back.
    BroadcastAll,
}

/// One instance's answer to a broadcast.
#[derive(Debug)]
pub struct InstanceReply {
    pub address: String,
    pub result: Result<Response>,
}

#[derive(Debug)]
pub enum Dispatched {
    Single(Response),
    /// Closed once every instance has answered.
    Stream(mpsc::Receiver<InstanceReply>),
}

/// Sends requests somewhere: one address, or a whole service.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn dispatch(&self, ctx: Context, req: Request, mode: CallMode) -> Result<Dispatched>;

    fn serialize_type(&self) -> SerializeType {
        SerializeType::JSON
    }

    fn compress_type(&self) -> CompressType {
        CompressType::CompressNone
    }
}
