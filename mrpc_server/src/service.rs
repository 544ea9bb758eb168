use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use mrpc_protocol::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One method of a service, working on raw frames.
pub type MethodFn = Arc<dyn Fn(Context, Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// The text an error travels as in `Response.error`.
pub fn wire_message(err: &Error) -> String {
    if err.message().is_empty() {
        err.kind().to_string()
    } else {
        err.message().to_owned()
    }
}

/// A named set of methods, built once before the server starts.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl Service {
    pub fn new(name: &str) -> Service {
        Service {
            name: name.to_owned(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn add_method(&mut self, name: &str, method: MethodFn) -> &mut Service {
        self.methods.insert(name.to_owned(), method);
        self
    }

    /// Registers a typed handler. Arguments are decoded with the request's own
    /// serializer and compressor, and the reply is encoded the same way.
    pub fn register_fn<Req, Resp, F, Fut>(&mut self, name: &str, f: F) -> &mut Service
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.register_reply_fn(name, move |ctx: Context, req: Req| f(ctx, req).map(Reply::from))
    }

    /// Like [`Service::register_fn`] for handlers that can return data and an
    /// error together; both are sent back.
    pub fn register_reply_fn<Req, Resp, F, Fut>(&mut self, name: &str, f: F) -> &mut Service
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply<Resp>> + Send + 'static,
    {
        let f = Arc::new(f);
        let method: MethodFn = Arc::new(move |ctx: Context, req: Request| {
            let f = f.clone();
            async move {
                let resp = Response::reply_to(&req);
                let args = match decode_args::<Req>(&req) {
                    Ok(args) => args,
                    Err(err) => return resp.with_error(&wire_message(&err)),
                };
                let reply = f(ctx, args).await;
                encode_reply(resp, reply)
            }
            .boxed()
        });
        self.add_method(name, method)
    }
}

fn decode_args<Req: DeserializeOwned>(req: &Request) -> Result<Req> {
    let data = compressor_of(req.compressor)?.decompress(&req.data)?;
    serializer_of(req.serializer)?.decode(&data)
}

fn encode_value<Resp: Serialize>(resp: &Response, value: &Resp) -> Result<Vec<u8>> {
    let data = serializer_of(resp.serializer)?.encode(value)?;
    compressor_of(resp.compressor)?.compress(&data)
}

fn encode_reply<Resp: Serialize>(resp: Response, reply: Reply<Resp>) -> Response {
    let encoded = reply.value.as_ref().map(|v| encode_value(&resp, v));
    match (encoded, reply.error) {
        (Some(Ok(data)), None) => resp.with_data(data),
        (Some(Ok(data)), Some(err)) => resp.with_data(data).with_error(&wire_message(&err)),
        (Some(Err(_)), Some(err)) | (None, Some(err)) => resp.with_error(&wire_message(&err)),
        (Some(Err(err)), None) => resp.with_error(&wire_message(&err)),
        (None, None) => resp,
    }
}

/// Routes requests to services by name. It is built when the server starts
/// and never changes afterwards.
pub struct Dispatcher {
    services: HashMap<String, Service>,
}

impl Dispatcher {
    pub fn new(services: impl IntoIterator<Item = Service>) -> Dispatcher {
        Dispatcher {
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Unknown services and methods come back as a response error with no
    /// data, never as a transport failure.
    pub async fn dispatch(&self, ctx: Context, req: Request) -> Response {
        let service = match self.services.get(&req.service_name) {
            Some(service) => service,
            None => {
                let err = Error::new(
                    ErrorKind::ServiceNotFound,
                    format!("service not found: {}", req.service_name),
                );
                return Response::reply_to(&req).with_error(&wire_message(&err));
            }
        };
        let method = match service.methods.get(&req.method) {
            Some(method) => method.clone(),
            None => {
                let err = Error::new(
                    ErrorKind::MethodNotFound,
                    format!("method not found: {}.{}", req.service_name, req.method),
                );
                return Response::reply_to(&req).with_error(&wire_message(&err));
            }
        };
        method(ctx, req).await
    }
}
