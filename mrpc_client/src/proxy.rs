use std::marker::PhantomData;
use std::sync::Arc;

use mrpc_protocol::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{next_message_id, CallMode, Dispatched, InstanceReply, Invoker};

/// The typed face of a remote service, shared by generated clients.
#[derive(Clone)]
pub struct Stub {
    service_name: String,
    invoker: Arc<dyn Invoker>,
    serialize_type: SerializeType,
    compress_type: CompressType,
    mode: CallMode,
}

impl Stub {
    pub fn new(service_name: &str, invoker: Arc<dyn Invoker>) -> Stub {
        Stub {
            service_name: service_name.to_owned(),
            serialize_type: invoker.serialize_type(),
            compress_type: invoker.compress_type(),
            invoker,
            mode: CallMode::Unary,
        }
    }

    /// Routes every [`Stub::call`] of this stub with `mode`.
    pub fn with_mode(mut self, mode: CallMode) -> Stub {
        self.mode = mode;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn request<Req>(&self, method: &str, req: &Req) -> Result<Request>
    where
        Req: Serialize + ?Sized,
    {
        let data = self.serialize_type.encode(req)?;
        let data = self.compress_type.compress(&data)?;
        Ok(Request::new(&self.service_name, method)
            .with_message_id(next_message_id())
            .with_codes(self.serialize_type, self.compress_type)
            .with_data(data))
    }

    pub async fn call<Req, Resp>(&self, ctx: Context, method: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with(ctx, method, req, self.mode).await
    }

    /// Like [`Stub::call`] but routed by `mode`. `BroadcastAll` has its own
    /// entry point, [`Stub::broadcast_all`].
    pub async fn call_with<Req, Resp>(
        &self,
        ctx: Context,
        method: &str,
        req: &Req,
        mode: CallMode,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        if mode == CallMode::BroadcastAll {
            return Err(Error::new(
                ErrorKind::Client,
                "broadcast-all calls return a stream, use broadcast_all",
            ));
        }
        let request = self.request(method, req)?;
        let oneway = ctx.is_oneway();
        match self.invoker.dispatch(ctx, request, mode).await? {
            Dispatched::Single(_) if oneway => Err(Error::new(
                ErrorKind::Oneway,
                "one-way call has no response",
            )),
            Dispatched::Single(resp) => decode_response(resp),
            Dispatched::Stream(_) => Err(Error::new(
                ErrorKind::Client,
                "invoker answered a single call with a stream",
            )),
        }
    }

    /// Calls every ready instance and streams typed replies as they arrive.
    pub async fn broadcast_all<Req, Resp>(
        &self,
        ctx: Context,
        method: &str,
        req: &Req,
    ) -> Result<BroadcastReplies<Resp>>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = self.request(method, req)?;
        match self.invoker.dispatch(ctx, request, CallMode::BroadcastAll).await? {
            Dispatched::Stream(rx) => Ok(BroadcastReplies {
                rx,
                _resp: PhantomData,
            }),
            Dispatched::Single(resp) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(InstanceReply {
                    address: String::new(),
                    result: Ok(resp),
                });
                Ok(BroadcastReplies {
                    rx,
                    _resp: PhantomData,
                })
            }
        }
    }
}

/// Turns a response into the caller's type. A response carrying an error
/// yields only the error, whatever data came with it.
pub fn decode_response<Resp>(resp: Response) -> Result<Resp>
where
    Resp: DeserializeOwned,
{
    if let Some(msg) = resp.error_message() {
        return Err(Error::new(ErrorKind::Server, msg));
    }
    let data = compressor_of(resp.compressor)?.decompress(&resp.data)?;
    serializer_of(resp.serializer)?.decode(&data)
}

/// Typed per-instance replies of a broadcast-all call.
pub struct BroadcastReplies<Resp> {
    rx: mpsc::Receiver<InstanceReply>,
    _resp: PhantomData<fn() -> Resp>,
}

impl<Resp: DeserializeOwned> BroadcastReplies<Resp> {
    /// `None` once every instance has replied.
    pub async fn recv(&mut self) -> Option<(String, Result<Resp>)> {
        let reply = self.rx.recv().await?;
        Some((reply.address, reply.result.and_then(decode_response)))
    }

    pub async fn collect(mut self) -> Vec<(String, Result<Resp>)> {
        let mut all = Vec::new();
        while let Some(reply) = self.recv().await {
            all.push(reply);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct GetByIdReq {
        id: u64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
    struct GetByIdResp {
        name: String,
    }

    /// Answers in process, echoing what it saw.
    struct Loopback {
        seen: Mutex<Vec<Request>>,
        error: Option<String>,
        compress_type: CompressType,
    }

    impl Loopback {
        fn new(error: Option<&str>, compress_type: CompressType) -> Arc<Loopback> {
            Arc::new(Loopback {
                seen: Mutex::new(Vec::new()),
                error: error.map(str::to_owned),
                compress_type,
            })
        }
    }

    #[async_trait]
    impl Invoker for Loopback {
        async fn dispatch(&self, _ctx: Context, req: Request, _mode: CallMode) -> Result<Dispatched> {
            self.seen.lock().unwrap().push(req.clone());
            let ct = compressor_of(req.compressor)?;
            let args: GetByIdReq = serializer_of(req.serializer)?.decode(&ct.decompress(&req.data)?)?;
            let body = SerializeType::JSON.encode(&GetByIdResp {
                name: format!("user-{}", args.id),
            })?;
            let mut resp = Response::reply_to(&req).with_data(ct.compress(&body)?);
            if let Some(err) = &self.error {
                resp = resp.with_error(err);
            }
            Ok(Dispatched::Single(resp))
        }

        fn compress_type(&self) -> CompressType {
            self.compress_type
        }
    }

    #[tokio::test]
    async fn call_round_trips_through_codecs() {
        let invoker = Loopback::new(None, CompressType::Gzip);
        let stub = Stub::new("user-service", invoker.clone());
        let resp: GetByIdResp = stub
            .call(Context::new(), "GetById", &GetByIdReq { id: 12 })
            .await
            .unwrap();
        assert_eq!("user-12", resp.name);

        let seen = invoker.seen.lock().unwrap();
        assert_eq!("user-service", seen[0].service_name);
        assert_eq!("GetById", seen[0].method);
        assert_eq!(CompressType::Gzip as u8, seen[0].compressor);
    }

    #[tokio::test]
    async fn remote_error_never_yields_a_value() {
        let stub = Stub::new("user-service", Loopback::new(Some("user banned"), CompressType::CompressNone));
        let err = stub
            .call::<_, GetByIdResp>(Context::new(), "GetById", &GetByIdReq { id: 1 })
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Server, err.kind());
        assert_eq!("user banned", err.message());
    }

    #[tokio::test]
    async fn oneway_has_no_response() {
        let stub = Stub::new("user-service", Loopback::new(None, CompressType::CompressNone));
        let err = stub
            .call::<_, GetByIdResp>(Context::new().with_oneway(), "GetById", &GetByIdReq { id: 1 })
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Oneway, err.kind());
    }

    #[tokio::test]
    async fn message_ids_are_unique() {
        let invoker = Loopback::new(None, CompressType::CompressNone);
        let stub = Stub::new("user-service", invoker.clone());
        for id in 0..3 {
            let _: GetByIdResp = stub
                .call(Context::new(), "GetById", &GetByIdReq { id })
                .await
                .unwrap();
        }
        let seen = invoker.seen.lock().unwrap();
        assert_ne!(seen[0].message_id, seen[1].message_id);
        assert_ne!(seen[1].message_id, seen[2].message_id);
    }
}
