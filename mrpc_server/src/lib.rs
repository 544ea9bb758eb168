use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mrpc_protocol::*;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod plugin;
pub mod service;

pub use plugin::*;
pub use service::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOpt {
    /// Listen address; port 0 picks a free port.
    pub addr: String,
    /// Address announced to the registry, when it differs from the bound one.
    pub advertise_addr: Option<String>,
    #[serde(with = "humantime_serde")]
    pub register_timeout: Duration,
    pub weight: u32,
    pub group: Option<String>,
    pub nodelay: Option<bool>,
}

impl Default for ServerOpt {
    fn default() -> Self {
        ServerOpt {
            addr: "127.0.0.1:8081".to_owned(),
            advertise_addr: None,
            register_timeout: Duration::from_secs(3),
            weight: 1,
            group: None,
            nodelay: Some(true),
        }
    }
}

/// Collects services, interceptors and plugins until [`Server::start`].
pub struct Server {
    pub opt: ServerOpt,
    services: Vec<Service>,
    interceptors: Vec<Interceptor>,
    register_plugins: Vec<Arc<dyn RegisterPlugin>>,
    connect_plugins: Vec<Arc<dyn ConnectPlugin>>,
}

impl Server {
    pub fn new(opt: ServerOpt) -> Self {
        Server {
            opt,
            services: Vec::new(),
            interceptors: Vec::new(),
            register_plugins: Vec::new(),
            connect_plugins: Vec::new(),
        }
    }

    pub fn register(&mut self, service: Service) -> Result<()> {
        if self.services.iter().any(|s| s.name() == service.name()) {
            return Err(Error::new(
                ErrorKind::Config,
                format!("service {} is already registered", service.name()),
            ));
        }
        debug!(service = %service.name(), methods = ?service.method_names(), "service added");
        self.services.push(service);
        Ok(())
    }

    /// Interceptors run around every dispatched request, first added outermost.
    pub fn add_interceptor(&mut self, interceptor: Interceptor) {
        self.interceptors.push(interceptor);
    }

    /// Binds the listener, starts serving, then registers every service.
    /// If a registration fails the server is stopped again and the error
    /// returned.
    pub async fn start(self) -> Result<RunningServer> {
        let listener = TcpListener::bind(&self.opt.addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = self
            .opt
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let service_names: Vec<String> = self.services.iter().map(|s| s.name().to_owned()).collect();
        let dispatcher = Arc::new(Dispatcher::new(self.services));
        let terminal = handler(move |ctx: Context, req: Request| {
            let dispatcher = dispatcher.clone();
            async move { Ok(dispatcher.dispatch(ctx, req).await) }
        });
        let chained = chain(&self.interceptors, terminal);

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            chained,
            self.connect_plugins,
            self.opt.nodelay,
            shutdown.clone(),
        ));
        info!(addr = %local_addr, services = ?service_names, "server started");

        let server = RunningServer {
            local_addr,
            advertised,
            service_names,
            register_plugins: self.register_plugins,
            register_timeout: self.opt.register_timeout,
            shutdown,
            accept,
        };
        if let Err(err) = server.register_all().await {
            error!(%err, "registration failed, stopping");
            if let Err(close_err) = server.close().await {
                warn!(err = %close_err, "stopping after a failed registration");
            }
            return Err(err);
        }
        Ok(server)
    }
}

/// A server that is accepting connections.
pub struct RunningServer {
    local_addr: SocketAddr,
    advertised: String,
    service_names: Vec<String>,
    register_plugins: Vec<Arc<dyn RegisterPlugin>>,
    register_timeout: Duration,
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address written to the registry.
    pub fn advertised_addr(&self) -> &str {
        &self.advertised
    }

    async fn register_all(&self) -> Result<()> {
        for name in &self.service_names {
            for plugin in &self.register_plugins {
                tokio::time::timeout(self.register_timeout, plugin.register(name, &self.advertised))
                    .await
                    .map_err(|_| {
                        Error::new(
                            ErrorKind::Timeout,
                            format!("registering {} took longer than {:?}", name, self.register_timeout),
                        )
                    })??;
            }
        }
        Ok(())
    }

    /// Withdraws every registration, then stops accepting and waits for open
    /// connections to finish their current request. Every plugin is asked to
    /// unregister even if an earlier one fails; the first failure is returned.
    pub async fn close(self) -> Result<()> {
        let mut first_err = None;
        for name in &self.service_names {
            for plugin in &self.register_plugins {
                let res = tokio::time::timeout(
                    self.register_timeout,
                    plugin.unregister(name, &self.advertised),
                )
                .await
                .unwrap_or_else(|_| Err(Error::new(ErrorKind::Timeout, "unregister timed out")));
                if let Err(err) = res {
                    warn!(service = %name, %err, "unregister failed");
                    first_err.get_or_insert(err);
                }
            }
        }

        self.shutdown.cancel();
        if let Err(err) = self.accept.await {
            first_err.get_or_insert(Error::new(ErrorKind::Other, err));
        }
        info!(addr = %self.local_addr, "server stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Handler,
    connect_plugins: Vec<Arc<dyn ConnectPlugin>>,
    nodelay: Option<bool>,
    shutdown: CancellationToken,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                if let Some(err) = connect_plugins.iter().find_map(|p| p.connected(peer).err()) {
                    warn!(%peer, %err, "connection rejected");
                    continue;
                }
                if let Some(nodelay) = nodelay {
                    if let Err(err) = stream.set_nodelay(nodelay) {
                        debug!(%peer, %err, "set_nodelay failed");
                    }
                }
                debug!(%peer, "connection accepted");
                conns.spawn(serve_conn(stream, peer, handler.clone(), shutdown.clone()));
            }
        }
    }
    while conns.join_next().await.is_some() {}
}

/// Serves one connection: one request at a time, answered in order.
async fn serve_conn(stream: TcpStream, peer: SocketAddr, handler: Handler, shutdown: CancellationToken) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%peer, %err, "connection closed");
                break;
            }
        };
        let req = match Request::decode(&frame) {
            Ok(req) => req,
            Err(err) => {
                warn!(%peer, %err, "malformed request, closing the connection");
                break;
            }
        };

        let oneway = req.is_oneway();
        let fallback = Response::reply_to(&req);
        let resp = handle(&handler, req).await;
        if oneway {
            continue;
        }
        let bytes = match resp.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%peer, %err, "response can not be encoded");
                match fallback.with_error(&wire_message(&err)).encode() {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                }
            }
        };
        if let Err(err) = write_frame(&mut writer, &bytes).await {
            debug!(%peer, %err, "write failed, closing the connection");
            break;
        }
    }
}

/// Runs the handler under the request's own deadline. Failures of the
/// chain itself still produce a response carrying the error.
async fn handle(handler: &Handler, req: Request) -> Response {
    let ctx = Context::from_request(&req);
    let fallback = Response::reply_to(&req);
    match ctx.run(handler(ctx.clone(), req)).await {
        Ok(resp) => resp,
        Err(err) => fallback.with_error(&wire_message(&err)),
    }
}
