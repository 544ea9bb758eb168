use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::message::{Metadata, MrpcMessage, META_GROUP, META_ONEWAY};
use crate::{Error, ErrorKind, Request, Result};

/// Per-call context: deadline, cancellation and outgoing metadata.
///
/// Cloning a context shares its cancellation; use [`Context::child`] for a
/// context that can be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    meta: Metadata,
    oneway: bool,
    group: Option<String>,
}

impl Context {
    pub fn new() -> Context {
        Default::default()
    }

    /// Shortens the deadline to `timeout` from now; an earlier deadline wins.
    /// A timeout too large to represent leaves the deadline as it is.
    pub fn with_timeout(self, timeout: Duration) -> Context {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Context {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Context {
        self.meta.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_oneway(mut self) -> Context {
        self.oneway = true;
        self
    }

    pub fn with_group(mut self, group: &str) -> Context {
        self.group = Some(group.to_owned());
        self
    }

    /// A context cancelled together with `self` but cancellable on its own.
    pub fn child(&self) -> Context {
        Context {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            meta: self.meta.clone(),
            oneway: self.oneway,
            group: self.group.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// The reason this context is finished, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::new(ErrorKind::Canceled, "context canceled"));
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => {
                Some(Error::new(ErrorKind::Timeout, "context deadline exceeded"))
            }
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Error::new(ErrorKind::Canceled, "context canceled"),
                    _ = tokio::time::sleep_until(deadline) => {
                        Error::new(ErrorKind::Timeout, "context deadline exceeded")
                    }
                }
            }
            None => {
                self.cancel.cancelled().await;
                Error::new(ErrorKind::Canceled, "context canceled")
            }
        }
    }

    /// Drives `fut` until it completes or the context finishes, whichever is first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }

    /// Copies metadata, deadline, one-way flag and group onto an outgoing request.
    pub fn apply_to(&self, req: &mut Request) {
        for (k, v) in &self.meta {
            req.meta.insert(k.clone(), v.clone());
        }
        if self.oneway {
            req.meta.insert(META_ONEWAY.to_owned(), "true".to_owned());
        }
        if let Some(group) = &self.group {
            req.meta.insert(META_GROUP.to_owned(), group.clone());
        }
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            req.set_deadline(SystemTime::now() + remaining);
        }
        req.set_head_length();
    }

    /// The server side view of an incoming request.
    pub fn from_request(req: &Request) -> Context {
        let mut ctx = Context {
            meta: req.meta.clone(),
            oneway: req.is_oneway(),
            group: req.meta.get(META_GROUP).cloned(),
            ..Default::default()
        };
        if let Some(deadline) = req.deadline() {
            let remaining = deadline
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            ctx.deadline = Instant::now().checked_add(remaining);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_on_timeout() {
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(ErrorKind::Timeout, res.unwrap_err().kind());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn run_returns_on_cancel() {
        let ctx = Context::new();
        let child = ctx.child();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let res: Result<()> = child.run(futures::future::pending()).await;
        assert_eq!(ErrorKind::Canceled, res.unwrap_err().kind());
    }

    #[test]
    fn earlier_deadline_wins() {
        let ctx = Context::new()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(10));
        let remaining = ctx.deadline().unwrap() - Instant::now();
        assert!(remaining <= Duration::from_secs(1));
    }

    #[test]
    fn unbounded_timeout_means_no_deadline() {
        let ctx = Context::new().with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());

        let ctx = Context::new()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_some());
    }

    #[test]
    fn far_remote_deadline_is_tolerated() {
        let req = Request::new("s", "m").with_meta(crate::META_DEADLINE, &u64::MAX.to_string());
        let ctx = Context::from_request(&req);
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn meta_survives_the_wire() {
        let ctx = Context::new()
            .with_timeout(Duration::from_secs(30))
            .with_meta("trace-id", "abc")
            .with_group("canary")
            .with_oneway();
        let mut req = Request::new("s", "m");
        ctx.apply_to(&mut req);

        let server = Context::from_request(&req);
        assert!(server.is_oneway());
        assert_eq!(Some("canary"), server.group());
        assert_eq!(Some(&"abc".to_owned()), server.meta().get("trace-id"));
        let remaining = server.deadline().unwrap() - Instant::now();
        assert!(remaining > Duration::from_secs(28));
        assert!(server.err().is_none());
    }
}
