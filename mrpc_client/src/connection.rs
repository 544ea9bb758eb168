use std::time::Duration;

use mrpc_protocol::{
    read_frame, write_frame, Context, Error, ErrorKind, MrpcMessage, Request, Response, Result,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::client::Opt;
use crate::pool::ConnectionPool;

/// One TCP connection carrying at most one in-flight request.
#[derive(Debug)]
pub struct TcpConnection {
    addr: String,
    stream: TcpStream,
}

impl TcpConnection {
    pub async fn connect(addr: &str, opt: &Opt) -> Result<TcpConnection> {
        let stream = if opt.connect_timeout == Duration::ZERO {
            TcpStream::connect(addr).await?
        } else {
            tokio::time::timeout(opt.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    Error::new(
                        ErrorKind::Network,
                        format!("connect to {} timed out after {:?}", addr, opt.connect_timeout),
                    )
                })??
        };
        if let Some(nodelay) = opt.nodelay {
            stream.set_nodelay(nodelay)?;
        }
        debug!(%addr, "connected");
        Ok(TcpConnection {
            addr: addr.to_owned(),
            stream,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Writes `req` and, unless it is one-way, reads the matching response.
    pub async fn round_trip(&mut self, req: &Request) -> Result<Option<Response>> {
        let frame = req.encode()?;
        write_frame(&mut self.stream, &frame).await?;
        if req.is_oneway() {
            return Ok(None);
        }

        let frame = read_frame(&mut self.stream).await?;
        let resp = Response::decode(&frame)?;
        if resp.message_id != req.message_id {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!(
                    "response {} does not answer request {}",
                    resp.message_id, req.message_id
                ),
            ));
        }
        Ok(Some(resp))
    }
}

/// A pool dialing `addr` with the socket options of `opt`.
pub fn dial_pool(addr: &str, opt: &Opt) -> Result<ConnectionPool<TcpConnection>> {
    let addr = addr.to_owned();
    let dial_opt = opt.clone();
    ConnectionPool::new(opt.pool.clone(), move || {
        let addr = addr.clone();
        let opt = dial_opt.clone();
        async move { TcpConnection::connect(&addr, &opt).await }
    })
}

/// Sends `req` over a pooled connection, bounded by `ctx`.
///
/// A connection goes back to the pool unless the error left its stream in an
/// unknown state (see [`Error::is_connection_fatal`]). One interrupted
/// mid-frame by `ctx` is closed.
pub async fn call_pool(
    pool: &ConnectionPool<TcpConnection>,
    ctx: &Context,
    mut req: Request,
) -> Result<Response> {
    ctx.apply_to(&mut req);
    ctx.run(async {
        let mut conn = pool.get().await?;
        match conn.round_trip(&req).await {
            Ok(resp) => {
                conn.release();
                Ok(resp.unwrap_or_else(|| Response::reply_to(&req)))
            }
            Err(err) if err.is_connection_fatal() => {
                debug!(addr = %conn.addr(), %err, "closing failed connection");
                conn.discard();
                Err(err)
            }
            Err(err) => {
                conn.release();
                Err(err)
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrpc_protocol::{CompressType, SerializeType};
    use tokio::net::TcpListener;

    /// Answers every request on every connection with an empty response.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(frame) = read_frame(&mut stream).await {
                        let req = Request::decode(&frame).unwrap();
                        let frame = Response::reply_to(&req).encode().unwrap();
                        if write_frame(&mut stream, &frame).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn request(id: u32) -> Request {
        Request::new("user-service", "GetById")
            .with_message_id(id)
            .with_codes(SerializeType::JSON, CompressType::CompressNone)
    }

    #[tokio::test]
    async fn local_encode_error_keeps_the_connection() {
        let addr = echo_server().await;
        let pool = dial_pool(&addr, &Opt::default()).unwrap();
        let ctx = Context::new();

        call_pool(&pool, &ctx, request(1)).await.unwrap();
        assert_eq!((1, 1), (pool.stats().open, pool.stats().idle));

        let err = call_pool(&pool, &ctx, request(2).with_meta("trace", "bad\nvalue"))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Encode, err.kind());
        assert_eq!((1, 1), (pool.stats().open, pool.stats().idle));

        let resp = call_pool(&pool, &ctx, request(3)).await.unwrap();
        assert_eq!(3, resp.message_id);
    }

    #[tokio::test]
    async fn interrupted_call_closes_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // accepts and never answers
        let silent = tokio::spawn(async move {
            let conn = listener.accept().await;
            futures::future::pending::<()>().await;
            drop(conn);
        });

        let pool = dial_pool(&addr, &Opt::default()).unwrap();
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        let err = call_pool(&pool, &ctx, request(1)).await.unwrap_err();
        assert_eq!(ErrorKind::Timeout, err.kind());
        assert_eq!((0, 0), (pool.stats().open, pool.stats().idle));
        silent.abort();
    }
}
