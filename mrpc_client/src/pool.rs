use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use mrpc_protocol::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Sizing of a per-address connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub max_open: usize,
    /// Idle connections older than this are closed instead of reused. Zero
    /// keeps them forever.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Upper bound for waiting on a busy pool; `None` waits as long as the
    /// caller's context allows.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Option<Duration>,
    pub fail_fast: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle: 20,
            max_open: 30,
            idle_timeout: Duration::from_secs(60),
            wait_timeout: None,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub waiters: usize,
}

type Factory<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

struct IdleConn<C> {
    conn: C,
    last_active: Instant,
}

enum Handoff<C: Send + 'static> {
    Conn(Pooled<C>),
    /// A freed admission; the waiter dials on its own.
    Slot(Permit<C>),
}

impl<C: Send + 'static> Handoff<C> {
    fn into_parts(self) -> (Option<C>, Permit<C>) {
        match self {
            Handoff::Conn(Pooled { conn, permit }) => (Some(conn), permit),
            Handoff::Slot(permit) => (None, permit),
        }
    }
}

struct State<C: Send + 'static> {
    idle: VecDeque<IdleConn<C>>,
    waiters: VecDeque<oneshot::Sender<Handoff<C>>>,
    open: usize,
    closed: bool,
}

struct Shared<C: Send + 'static> {
    config: PoolConfig,
    factory: Factory<C>,
    state: Mutex<State<C>>,
}

impl<C: Send + 'static> Shared<C> {
    fn state(&self) -> MutexGuard<'_, State<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self, idle: &IdleConn<C>) -> bool {
        !self.config.idle_timeout.is_zero()
            && idle.last_active.elapsed() > self.config.idle_timeout
    }
}

/// Gives a freed admission to the oldest live waiter, or gives it back.
fn free_slot<C: Send + 'static>(shared: &Arc<Shared<C>>, st: &mut State<C>) {
    while let Some(waiter) = st.waiters.pop_front() {
        match waiter.send(Handoff::Slot(Permit::new(shared.clone()))) {
            Ok(()) => return,
            Err(handoff) => {
                handoff.into_parts().1.disarm();
            }
        }
    }
    st.open = st.open.saturating_sub(1);
}

/// One admission against `max_open`. Dropping it frees the admission.
struct Permit<C: Send + 'static> {
    shared: Option<Arc<Shared<C>>>,
}

impl<C: Send + 'static> Permit<C> {
    fn new(shared: Arc<Shared<C>>) -> Permit<C> {
        Permit {
            shared: Some(shared),
        }
    }

    fn disarm(mut self) -> Option<Arc<Shared<C>>> {
        self.shared.take()
    }
}

impl<C: Send + 'static> Drop for Permit<C> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut st = shared.state();
            free_slot(&shared, &mut st);
        }
    }
}

/// A connection checked out of a pool.
///
/// [`Pooled::release`] returns it for reuse. Dropping it instead closes the
/// connection, which is what happens to a call that failed or was cancelled
/// halfway through a frame.
pub struct Pooled<C: Send + 'static> {
    conn: C,
    permit: Permit<C>,
}

impl<C: Send + 'static> Pooled<C> {
    pub fn release(self) {
        let Pooled { conn, permit } = self;
        let shared = match permit.disarm() {
            Some(shared) => shared,
            None => return,
        };
        let mut st = shared.state();

        let mut conn = conn;
        while let Some(waiter) = st.waiters.pop_front() {
            let handoff = Handoff::Conn(Pooled {
                conn,
                permit: Permit::new(shared.clone()),
            });
            match waiter.send(handoff) {
                Ok(()) => return,
                Err(handoff) => match handoff.into_parts() {
                    (Some(back), permit) => {
                        permit.disarm();
                        conn = back;
                    }
                    (None, permit) => {
                        permit.disarm();
                        return;
                    }
                },
            }
        }

        if !st.closed && st.idle.len() < shared.config.max_idle {
            st.idle.push_back(IdleConn {
                conn,
                last_active: Instant::now(),
            });
        } else {
            st.open = st.open.saturating_sub(1);
            drop(conn);
        }
    }

    pub fn discard(self) {
        debug!("discarding pooled connection");
    }
}

impl<C: Send + 'static> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Send + 'static> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: Send + 'static> fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pooled")
    }
}

/// A bounded set of reusable connections to one address.
pub struct ConnectionPool<C: Send + 'static> {
    shared: Arc<Shared<C>>,
}

impl<C: Send + 'static> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new<F, Fut>(config: PoolConfig, factory: F) -> Result<ConnectionPool<C>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        if config.max_open == 0 {
            return Err(Error::new(ErrorKind::Config, "max_open must be positive"));
        }
        let factory: Factory<C> = Arc::new(move || factory().boxed());
        Ok(ConnectionPool {
            shared: Arc::new(Shared {
                config,
                factory,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    open: 0,
                    closed: false,
                }),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Checks out a connection: an idle one, a fresh one while below
    /// `max_open`, or the next one released by another caller.
    pub async fn get(&self) -> Result<Pooled<C>> {
        let mut rx = {
            let mut st = self.shared.state();
            if st.closed {
                return Err(Error::new(ErrorKind::PoolExhausted, "pool is closed"));
            }
            while let Some(idle) = st.idle.pop_front() {
                if self.shared.expired(&idle) {
                    debug!("closing expired idle connection");
                    drop(idle);
                    free_slot(&self.shared, &mut st);
                    continue;
                }
                return Ok(Pooled {
                    conn: idle.conn,
                    permit: Permit::new(self.shared.clone()),
                });
            }

            if st.open < self.shared.config.max_open {
                st.open += 1;
                None
            } else if self.shared.config.fail_fast {
                return Err(Error::new(
                    ErrorKind::PoolExhausted,
                    format!("all {} connections are busy", st.open),
                ));
            } else {
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                Some(rx)
            }
        };

        let permit = match rx.as_mut() {
            None => Permit::new(self.shared.clone()),
            Some(rx) => {
                let handoff = match self.shared.config.wait_timeout {
                    Some(wait) => match tokio::time::timeout(wait, &mut *rx).await {
                        Ok(handoff) => handoff
                            .map_err(|_| Error::new(ErrorKind::PoolExhausted, "pool is closed")),
                        Err(_) => {
                            rx.close();
                            rx.try_recv().map_err(|_| {
                                Error::new(
                                    ErrorKind::PoolExhausted,
                                    format!("no connection released within {:?}", wait),
                                )
                            })
                        }
                    },
                    None => (&mut *rx)
                        .await
                        .map_err(|_| Error::new(ErrorKind::PoolExhausted, "pool is closed")),
                }?;
                match handoff {
                    Handoff::Conn(pooled) => return Ok(pooled),
                    Handoff::Slot(permit) => permit,
                }
            }
        };

        // the permit frees the admission if dialing fails or is cancelled
        let conn = (self.shared.factory)().await?;
        Ok(Pooled { conn, permit })
    }

    /// Closes idle connections and fails current and future waiters. Checked
    /// out connections are closed when they come back.
    pub fn close(&self) {
        let mut st = self.shared.state();
        st.closed = true;
        let idle = st.idle.len();
        st.idle.clear();
        st.open = st.open.saturating_sub(idle);
        st.waiters.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.state();
        PoolStats {
            open: st.open,
            idle: st.idle.len(),
            waiters: st.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }
}
