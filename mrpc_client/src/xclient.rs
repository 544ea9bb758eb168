use std::sync::Arc;

use async_trait::async_trait;
use mrpc_protocol::*;
use mrpc_registry::Registry;
use tokio::sync::mpsc;
use tracing::debug;

use crate::balancer::Balancer;
use crate::client::Opt;
use crate::connection::call_pool;
use crate::discovery::Resolver;
use crate::selector::{Builder, DoneInfo, Endpoint, Filter, PickInfo};
use crate::{CallMode, Dispatched, InstanceReply, Invoker};

/// A client for every instance of one service, kept current by a registry.
pub struct XClient {
    pub opt: Opt,
    service_name: String,
    balancer: Arc<Balancer>,
    resolver: Resolver,
    interceptors: Vec<Interceptor>,
    unary: Handler,
}

pub struct XClientBuilder {
    service_name: String,
    registry: Arc<dyn Registry>,
    opt: Opt,
    filter: Option<Filter>,
    interceptors: Vec<Interceptor>,
}

impl XClientBuilder {
    pub fn opt(mut self, opt: Opt) -> Self {
        self.opt = opt;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Resolves the service once, then keeps following the registry.
    pub async fn build(self) -> Result<XClient> {
        let mut builder = Builder::new(self.opt.select_mode);
        if let Some(filter) = self.filter {
            builder = builder.with_filter(filter);
        }
        let balancer = Arc::new(Balancer::new(
            &self.service_name,
            self.opt.clone(),
            Box::new(builder),
        ));
        let resolver = Resolver::build(
            self.registry,
            &self.service_name,
            balancer.clone(),
            self.opt.resolve_timeout,
        )
        .await?;

        let pick_balancer = balancer.clone();
        let terminal = handler(move |ctx: Context, req: Request| {
            let balancer = pick_balancer.clone();
            async move {
                let picked = balancer.pick(&PickInfo {
                    service_name: &req.service_name,
                    method: &req.method,
                    ctx: &ctx,
                })?;
                let res = call_pool(&picked.endpoint.pool, &ctx, req).await;
                picked.done.call(done_info(&res));
                res
            }
        });

        Ok(XClient {
            unary: chain(&self.interceptors, terminal),
            opt: self.opt,
            service_name: self.service_name,
            balancer,
            resolver,
            interceptors: self.interceptors,
        })
    }
}

fn done_info(res: &Result<Response>) -> DoneInfo {
    match res {
        Ok(resp) => match resp.error_message() {
            Some(msg) => DoneInfo::failed(Error::new(ErrorKind::Server, msg)),
            None => DoneInfo::ok(),
        },
        Err(err) => DoneInfo::failed(err.clone()),
    }
}

fn endpoint_handler(endpoint: Arc<Endpoint>) -> Handler {
    handler(move |ctx: Context, req: Request| {
        let endpoint = endpoint.clone();
        async move { call_pool(&endpoint.pool, &ctx, req).await }
    })
}

impl XClient {
    pub fn builder(service_name: &str, registry: Arc<dyn Registry>) -> XClientBuilder {
        XClientBuilder {
            service_name: service_name.to_owned(),
            registry,
            opt: Opt::default(),
            filter: None,
            interceptors: Vec::new(),
        }
    }

    pub async fn new(service_name: &str, registry: Arc<dyn Registry>, opt: Opt) -> Result<XClient> {
        XClient::builder(service_name, registry).opt(opt).build().await
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn resolve_now(&self) {
        self.resolver.resolve_now();
    }

    pub async fn call(&self, ctx: Context, req: Request) -> Result<Response> {
        (self.unary)(ctx, req).await
    }

    /// Sends `req` to every ready instance, one task each. The stream has room
    /// for every reply so no branch ever waits on a slow reader.
    pub fn broadcast(&self, ctx: &Context, req: Request) -> Result<mpsc::Receiver<InstanceReply>> {
        let ready = self.balancer.ready();
        if ready.is_empty() {
            return Err(Error::new(
                ErrorKind::NoConnectionAvailable,
                format!("no instance of {} is ready", self.service_name),
            ));
        }

        let (tx, rx) = mpsc::channel(ready.len());
        for endpoint in ready {
            let address = endpoint.address().to_owned();
            let h = chain(&self.interceptors, endpoint_handler(endpoint));
            let tx = tx.clone();
            let ctx = ctx.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let result = h(ctx, req).await;
                if tx.send(InstanceReply { address, result }).await.is_err() {
                    debug!("broadcast reply dropped, receiver is gone");
                }
            });
        }
        Ok(rx)
    }

    /// First successful response of a broadcast. Fails only when every
    /// instance failed, with the last failure seen.
    pub async fn broadcast_fastest(&self, ctx: Context, req: Request) -> Result<Response> {
        let branches = ctx.child();
        let mut rx = self.broadcast(&branches, req)?;
        let mut last: Option<Result<Response>> = None;
        loop {
            let reply = tokio::select! {
                err = ctx.done() => {
                    branches.cancel();
                    return Err(err);
                }
                reply = rx.recv() => reply,
            };
            match reply {
                Some(InstanceReply {
                    result: Ok(resp), ..
                }) if !resp.has_error() => {
                    branches.cancel();
                    return Ok(resp);
                }
                Some(InstanceReply { address, result }) => {
                    debug!(%address, "broadcast branch failed");
                    last = Some(result);
                }
                None => break,
            }
        }
        last.unwrap_or_else(|| {
            Err(Error::new(
                ErrorKind::NoConnectionAvailable,
                "broadcast finished without replies",
            ))
        })
    }

    pub fn close(&self) {
        self.resolver.close();
        self.balancer.close();
    }
}

#[async_trait]
impl Invoker for XClient {
    async fn dispatch(&self, ctx: Context, req: Request, mode: CallMode) -> Result<Dispatched> {
        match mode {
            CallMode::Unary => Ok(Dispatched::Single(self.call(ctx, req).await?)),
            CallMode::BroadcastFastest => Ok(Dispatched::Single(
                self.broadcast_fastest(ctx, req).await?,
            )),
            CallMode::BroadcastAll => Ok(Dispatched::Stream(self.broadcast(&ctx, req)?)),
        }
    }

    fn serialize_type(&self) -> SerializeType {
        self.opt.serialize_type
    }

    fn compress_type(&self) -> CompressType {
        self.opt.compress_type
    }
}
