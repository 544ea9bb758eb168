use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mrpc_protocol::{Context, Error, ErrorKind, Result};
use mrpc_registry::ServiceInstance;
use rand::{thread_rng, Rng};
use strum_macros::{Display, EnumIter, EnumString};
use tokio::time::Instant;

use crate::client::Opt;
use crate::connection::{dial_pool, TcpConnection};
use crate::pool::ConnectionPool;

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString)]
pub enum SelectMode {
    //RandomSelect is selecting randomly
    RandomSelect = 0,
    //RoundRobin is selecting by exact rotation
    RoundRobin = 1,
    //WeightedRoundRobin is selecting by smooth weighted round robin
    WeightedRoundRobin = 2,
    //WeightedRandom is selecting randomly in proportion to weight
    WeightedRandom = 3,
    //LeastActive is selecting the instance with the fewest in-flight calls
    LeastActive = 4,
    //Fastest is selecting the instance with the lowest average response time
    Fastest = 5,
}

/// Latency assumed for an endpoint that has not answered yet.
pub const INITIAL_LATENCY: Duration = Duration::from_millis(100);

/// A ready instance together with the pool of connections to it.
pub struct Endpoint {
    pub instance: ServiceInstance,
    pub pool: ConnectionPool<TcpConnection>,
    active: AtomicU32,
    /// moving average of response times, in microseconds.
    latency: AtomicU64,
}

impl Endpoint {
    pub fn new(instance: ServiceInstance, opt: &Opt) -> Result<Endpoint> {
        let pool = dial_pool(&instance.address, opt)?;
        Ok(Endpoint::with_pool(instance, pool))
    }

    /// Reuses the connections of an endpoint whose instance data changed.
    pub(crate) fn with_pool(instance: ServiceInstance, pool: ConnectionPool<TcpConnection>) -> Endpoint {
        Endpoint {
            instance,
            pool,
            active: AtomicU32::new(0),
            latency: AtomicU64::new(INITIAL_LATENCY.as_micros() as u64),
        }
    }

    pub fn address(&self) -> &str {
        &self.instance.address
    }

    /// Calls picked on this endpoint whose `Done` has not run yet.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Exponentially weighted average of the response times seen through the
    /// `Fastest` picker.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency.load(Ordering::Acquire))
    }

    /// Folds one response time into the average, weighing it by 3/10.
    fn record_latency(&self, sample: Duration) {
        let sample = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
        let _ = self
            .latency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
                Some(((u128::from(avg) * 7 + u128::from(sample) * 3) / 10) as u64)
            });
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("instance", &self.instance)
            .field("active", &self.active())
            .field("latency", &self.latency())
            .finish()
    }
}

pub struct PickInfo<'a> {
    pub service_name: &'a str,
    pub method: &'a str,
    pub ctx: &'a Context,
}

#[derive(Debug, Default)]
pub struct DoneInfo {
    pub error: Option<Error>,
}

impl DoneInfo {
    pub fn ok() -> DoneInfo {
        DoneInfo { error: None }
    }

    pub fn failed(err: Error) -> DoneInfo {
        DoneInfo { error: Some(err) }
    }
}

/// Completion callback of a pick. Runs exactly once: on [`Done::call`] or,
/// if the call was abandoned, on drop with a cancellation error.
pub struct Done(Option<Box<dyn FnOnce(DoneInfo) + Send>>);

impl Done {
    pub fn new<F>(f: F) -> Done
    where
        F: FnOnce(DoneInfo) + Send + 'static,
    {
        Done(Some(Box::new(f)))
    }

    pub fn noop() -> Done {
        Done(None)
    }

    pub fn call(mut self, info: DoneInfo) {
        if let Some(f) = self.0.take() {
            f(info)
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f(DoneInfo::failed(Error::new(ErrorKind::Canceled, "call abandoned")))
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Done(pending)" } else { "Done" })
    }
}

#[derive(Debug)]
pub struct PickResult {
    pub endpoint: Arc<Endpoint>,
    pub done: Done,
}

impl PickResult {
    fn plain(endpoint: &Arc<Endpoint>) -> PickResult {
        PickResult {
            endpoint: endpoint.clone(),
            done: Done::noop(),
        }
    }
}

/// Chooses one endpoint of an immutable ready set per call.
pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo) -> Result<PickResult>;
}

/// Builds a picker over a fresh ready set.
pub trait PickerBuilder: Send + Sync {
    fn build(&self, ready: Vec<Arc<Endpoint>>) -> Arc<dyn Picker>;
}

/// Decides whether an instance may serve a call.
pub type Filter = Arc<dyn Fn(&PickInfo, &ServiceInstance) -> bool + Send + Sync>;

/// Keeps instances whose group equals the call context's group. Calls without
/// a group may go anywhere.
pub fn group_filter() -> Filter {
    Arc::new(|info: &PickInfo, si: &ServiceInstance| match info.ctx.group() {
        Some(group) => si.group.as_deref() == Some(group),
        None => true,
    })
}

fn no_connection() -> Error {
    Error::new(ErrorKind::NoConnectionAvailable, "no connection available")
}

fn candidates<'a>(
    ready: &'a [Arc<Endpoint>],
    filter: &Option<Filter>,
    info: &PickInfo,
) -> Vec<&'a Arc<Endpoint>> {
    match filter {
        Some(filter) => ready.iter().filter(|e| filter(info, &e.instance)).collect(),
        None => ready.iter().collect(),
    }
}

/// Round robin with a mutex guarded cursor, so N picks over k endpoints land
/// in exact cyclic order. A lock free counter would only approximate that
/// rotation under contention.
pub struct RoundRobin {
    ready: Vec<Arc<Endpoint>>,
    cursor: Mutex<usize>,
    filter: Option<Filter>,
}

impl Picker for RoundRobin {
    fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        let cands = candidates(&self.ready, &self.filter, info);
        if cands.is_empty() {
            return Err(no_connection());
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cursor % cands.len();
        *cursor = index + 1;
        Ok(PickResult::plain(cands[index]))
    }
}

pub struct Random {
    ready: Vec<Arc<Endpoint>>,
    filter: Option<Filter>,
}

impl Picker for Random {
    fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        let cands = candidates(&self.ready, &self.filter, info);
        if cands.is_empty() {
            return Err(no_connection());
        }
        let index = thread_rng().gen_range(0..cands.len());
        Ok(PickResult::plain(cands[index]))
    }
}

/// Selection probability of an endpoint is `weight / total weight`.
pub struct WeightedRandom {
    ready: Vec<Arc<Endpoint>>,
    filter: Option<Filter>,
}

impl Picker for WeightedRandom {
    fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        let cands = candidates(&self.ready, &self.filter, info);
        if cands.is_empty() {
            return Err(no_connection());
        }
        let total: u64 = cands
            .iter()
            .map(|e| u64::from(e.instance.weight_or_default()))
            .sum();
        if total == 0 {
            return Err(Error::new(
                ErrorKind::Config,
                "total weight of the ready instances is zero",
            ));
        }

        // drawing from 1..=total keeps weight 0 unreachable
        let mut val = thread_rng().gen_range(1..=total) as i64;
        for e in &cands {
            val -= i64::from(e.instance.weight_or_default());
            if val <= 0 {
                return Ok(PickResult::plain(e));
            }
        }
        Err(no_connection())
    }
}

/// Picks the endpoint with the fewest in-flight calls, first one on ties.
///
/// The counters are atomics read without a lock; two concurrent picks may
/// both see the same minimum, which only costs fairness.
pub struct LeastActive {
    ready: Vec<Arc<Endpoint>>,
    filter: Option<Filter>,
}

impl Picker for LeastActive {
    fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        let cands = candidates(&self.ready, &self.filter, info);
        let mut best: Option<&Arc<Endpoint>> = None;
        for e in cands {
            match best {
                Some(b) if b.active() <= e.active() => {}
                _ => best = Some(e),
            }
        }
        let endpoint = best.ok_or_else(no_connection)?.clone();

        endpoint.active.fetch_add(1, Ordering::AcqRel);
        let tracked = endpoint.clone();
        Ok(PickResult {
            endpoint,
            done: Done::new(move |_| {
                tracked.active.fetch_sub(1, Ordering::AcqRel);
            }),
        })
    }
}

/// Picks the endpoint with the lowest average response time, first one on
/// ties. A failed or abandoned call counts as at least twice the current
/// average, so an endpoint failing fast does not look fast.
pub struct Fastest {
    ready: Vec<Arc<Endpoint>>,
    filter: Option<Filter>,
}

impl Picker for Fastest {
    fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        let cands = candidates(&self.ready, &self.filter, info);
        let endpoint = cands
            .into_iter()
            .reduce(|best, e| if e.latency() < best.latency() { e } else { best })
            .ok_or_else(no_connection)?
            .clone();

        let tracked = endpoint.clone();
        let start = Instant::now();
        Ok(PickResult {
            endpoint,
            done: Done::new(move |done: DoneInfo| {
                let elapsed = start.elapsed();
                let sample = match done.error {
                    Some(_) => elapsed.max(tracked.latency().saturating_mul(2)),
                    None => elapsed,
                };
                tracked.record_latency(sample);
            }),
        })
    }
}

struct WeightedNode {
    endpoint: Arc<Endpoint>,
    weight: u32,
    current: i64,
    efficient: Arc<AtomicU32>,
}

/// Smooth weighted round robin. A failed call lowers the endpoint's effective
/// weight by one, a successful one raises it back towards the configured
/// weight. The effective weight never wraps around.
pub struct WeightedRoundRobin {
    nodes: Mutex<Vec<WeightedNode>>,
    filter: Option<Filter>,
}

impl Picker for WeightedRoundRobin {
    fn pick(&self, info: &PickInfo) -> Result<PickResult> {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (i, node) in nodes.iter_mut().enumerate() {
            if let Some(filter) = &self.filter {
                if !filter(info, &node.endpoint.instance) {
                    continue;
                }
            }
            let efficient = i64::from(node.efficient.load(Ordering::Acquire));
            total += efficient;
            node.current += efficient;
            if best.map_or(true, |(_, current)| current < node.current) {
                best = Some((i, node.current));
            }
        }
        let (index, _) = best.ok_or_else(no_connection)?;
        let node = &mut nodes[index];
        node.current -= total;

        let efficient = node.efficient.clone();
        let weight = node.weight;
        Ok(PickResult {
            endpoint: node.endpoint.clone(),
            done: Done::new(move |done: DoneInfo| {
                let _ = efficient.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    match done.error {
                        Some(_) => w.checked_sub(1),
                        None if w < weight => Some(w + 1),
                        None => None,
                    }
                });
            }),
        })
    }
}

/// Which policy a [`Balancer`](crate::balancer::Balancer) rebuilds on every
/// ready-set change, with an optional filter.
pub struct Builder {
    mode: SelectMode,
    filter: Option<Filter>,
}

impl Builder {
    pub fn new(mode: SelectMode) -> Builder {
        Builder { mode, filter: None }
    }

    pub fn with_filter(mut self, filter: Filter) -> Builder {
        self.filter = Some(filter);
        self
    }
}

impl PickerBuilder for Builder {
    fn build(&self, ready: Vec<Arc<Endpoint>>) -> Arc<dyn Picker> {
        let filter = self.filter.clone();
        match self.mode {
            SelectMode::RandomSelect => Arc::new(Random { ready, filter }),
            SelectMode::RoundRobin => Arc::new(RoundRobin {
                ready,
                cursor: Mutex::new(0),
                filter,
            }),
            SelectMode::WeightedRandom => Arc::new(WeightedRandom { ready, filter }),
            SelectMode::LeastActive => Arc::new(LeastActive { ready, filter }),
            SelectMode::Fastest => Arc::new(Fastest { ready, filter }),
            SelectMode::WeightedRoundRobin => Arc::new(WeightedRoundRobin {
                nodes: Mutex::new(
                    ready
                        .into_iter()
                        .map(|endpoint| {
                            let weight = endpoint.instance.weight_or_default();
                            WeightedNode {
                                endpoint,
                                weight,
                                current: 0,
                                efficient: Arc::new(AtomicU32::new(weight)),
                            }
                        })
                        .collect(),
                ),
                filter,
            }),
        }
    }
}
