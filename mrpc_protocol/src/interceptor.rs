use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::{Context, Request, Response, Result};

/// One step of a call, on either side of the wire.
pub type Handler =
    Arc<dyn Fn(Context, Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Wraps a handler: `(next) -> next`. An interceptor that does not handle an
/// error itself must return it unchanged.
pub type Interceptor = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |ctx: Context, req: Request| f(ctx, req).boxed())
}

pub fn interceptor<F>(f: F) -> Interceptor
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The first interceptor ends up outermost.
pub fn chain(interceptors: &[Interceptor], handler: Handler) -> Handler {
    interceptors
        .iter()
        .rev()
        .fold(handler, |next, interceptor| interceptor(next))
}

/// Emits one tracing event per call.
pub fn logging_interceptor(side: &'static str) -> Interceptor {
    interceptor(move |next: Handler| {
        handler(move |ctx: Context, req: Request| {
            let next = next.clone();
            async move {
                let service = req.service_name.clone();
                let method = req.method.clone();
                let start = Instant::now();
                let res = next(ctx, req).await;
                let elapsed = start.elapsed();
                match &res {
                    Ok(resp) => match resp.error_message() {
                        Some(err) => debug!(side, %service, %method, ?elapsed, %err, "call returned an error"),
                        None => debug!(side, %service, %method, ?elapsed, "call finished"),
                    },
                    Err(err) => warn!(side, %service, %method, ?elapsed, %err, "call failed"),
                }
                res
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, ErrorKind};
    use std::sync::Mutex;

    fn recording(name: &'static str, trail: Arc<Mutex<Vec<String>>>) -> Interceptor {
        interceptor(move |next: Handler| {
            let trail = trail.clone();
            handler(move |ctx: Context, req: Request| {
                let next = next.clone();
                let trail = trail.clone();
                async move {
                    trail.lock().unwrap().push(format!("{} before {}", name, req.method));
                    let res = next(ctx, req).await;
                    trail.lock().unwrap().push(format!("{} after", name));
                    res
                }
            })
        })
    }

    #[tokio::test]
    async fn chain_order() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let inner_trail = trail.clone();
        let h = handler(move |_ctx: Context, req: Request| {
            let trail = inner_trail.clone();
            async move {
                trail.lock().unwrap().push("handler".to_owned());
                Ok(Response::reply_to(&req))
            }
        });
        let h = chain(
            &[
                recording("outer", trail.clone()),
                recording("inner", trail.clone()),
            ],
            h,
        );
        h(Context::new(), Request::new("s", "m")).await.unwrap();

        assert_eq!(
            vec!["outer before m", "inner before m", "handler", "inner after", "outer after"],
            *trail.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn errors_pass_through_logging() {
        let h = handler(|_ctx: Context, _req: Request| async {
            Err::<Response, _>(Error::new(ErrorKind::Network, "reset"))
        });
        let h = chain(&[logging_interceptor("client")], h);
        let err = h(Context::new(), Request::new("s", "m")).await.unwrap_err();
        assert_eq!(Error::new(ErrorKind::Network, "reset"), err);
    }
}
