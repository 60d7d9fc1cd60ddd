//! Shared decode resources: memory budget, worker pool, engine and strategy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use rayon::ThreadPool;
use tracing::{debug, info};

use crate::engine::DecodeEngine;
use crate::error::DecodeError;
use crate::logging::{ERRORS, WARNINGS};
use crate::params::DiscardHeuristic;
use crate::source::Priming;

static MESSAGE_SINKS: Once = Once::new();

struct BrokerState {
    in_use: AtomicU64,
    peak: AtomicU64,
    limit: Option<u64>,
}

/// Byte budget for in-flight decode state, shared by every session of a
/// context.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// A negative limit means unbounded.
    pub fn new(limit: i64) -> Self {
        Self {
            state: Arc::new(BrokerState {
                in_use: AtomicU64::new(0),
                peak: AtomicU64::new(0),
                limit: u64::try_from(limit).ok(),
            }),
        }
    }

    /// Reserves `bytes`, released when the returned guard drops.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation, DecodeError> {
        let limit = self.state.limit;
        let reserved = self
            .state
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                let total = in_use.checked_add(bytes)?;
                match limit {
                    Some(limit) if total > limit => None,
                    _ => Some(total),
                }
            });

        match reserved {
            Ok(previous) => {
                self.state.peak.fetch_max(previous + bytes, Ordering::AcqRel);
                Ok(Reservation {
                    broker: self.clone(),
                    bytes,
                })
            }
            Err(_) => Err(DecodeError::MemoryExhausted {
                requested: bytes,
                limit: limit.unwrap_or(u64::MAX),
            }),
        }
    }

    pub fn in_use(&self) -> u64 {
        self.state.in_use.load(Ordering::Acquire)
    }

    /// Highest `in_use` value observed.
    pub fn peak(&self) -> u64 {
        self.state.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<u64> {
        self.state.limit
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("in_use", &self.in_use())
            .field("peak", &self.peak())
            .field("limit", &self.state.limit)
            .finish()
    }
}

/// Bytes held against a [`MemoryBroker`].
#[must_use]
pub struct Reservation {
    broker: MemoryBroker,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.broker.state.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("bytes", &self.bytes).finish()
    }
}

/// Worker pool used by the engine for parallel block decode.
#[derive(Clone)]
pub struct ThreadEnv {
    pool: Arc<ThreadPool>,
}

impl ThreadEnv {
    pub fn new(threads: usize) -> Result<Self, DecodeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("jpegexp-decode-{index}"))
            .build()
            .map_err(|err| DecodeError::ThreadPool(err.to_string()))?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the pool, blocking until it returns.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}

impl fmt::Debug for ThreadEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEnv").field("threads", &self.threads()).finish()
    }
}

/// Which worker pool a session decodes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threading {
    /// The context's shared pool.
    #[default]
    Context,
    /// A private pool of this many threads, dropped with the session.
    Session(usize),
    /// The calling thread only.
    None,
}

/// Per-context decode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStrategy {
    pub threading: Threading,
    /// Applied to sources when an image is opened.
    pub priming: Priming,
    pub discard: DiscardHeuristic,
    /// Ask the engine for exact arithmetic in the inverse transform.
    pub precise: bool,
    /// Trade quality for speed where the engine allows it.
    pub fastest: bool,
}

impl Default for DecodeStrategy {
    fn default() -> Self {
        Self {
            threading: Threading::Context,
            priming: Priming::Lazy,
            discard: DiscardHeuristic::BitLength,
            precise: true,
            fastest: false,
        }
    }
}

struct ContextInner {
    engine: Arc<dyn DecodeEngine>,
    memory: MemoryBroker,
    threads: Option<ThreadEnv>,
    strategy: DecodeStrategy,
}

/// Resources shared by every image and session decoded with it. Cloning is
/// cheap and shares the same resources.
#[derive(Clone)]
pub struct DecodeContext {
    inner: Arc<ContextInner>,
}

impl DecodeContext {
    /// A context with the default strategy. A negative `memory_limit` is
    /// unbounded; `thread_count == 0` decodes on the calling thread.
    pub fn new(
        engine: Arc<dyn DecodeEngine>,
        memory_limit: i64,
        thread_count: usize,
    ) -> Result<Self, DecodeError> {
        Self::builder(engine)
            .memory_limit(memory_limit)
            .threads(thread_count)
            .build()
    }

    pub fn builder(engine: Arc<dyn DecodeEngine>) -> DecodeContextBuilder {
        DecodeContextBuilder {
            engine,
            memory_limit: -1,
            threads: None,
            strategy: DecodeStrategy::default(),
        }
    }

    pub fn engine(&self) -> &dyn DecodeEngine {
        self.inner.engine.as_ref()
    }

    pub fn memory(&self) -> &MemoryBroker {
        &self.inner.memory
    }

    /// The shared pool, if the context has one.
    pub fn threads(&self) -> Option<&ThreadEnv> {
        self.inner.threads.as_ref()
    }

    pub fn strategy(&self) -> &DecodeStrategy {
        &self.inner.strategy
    }

    /// Resolves the pool one session decodes on.
    pub(crate) fn session_threads(&self) -> Result<Option<ThreadEnv>, DecodeError> {
        match self.inner.strategy.threading {
            Threading::Context => Ok(self.inner.threads.clone()),
            Threading::Session(0) | Threading::None => Ok(None),
            Threading::Session(threads) => ThreadEnv::new(threads).map(Some),
        }
    }
}

impl fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("memory", &self.inner.memory)
            .field("threads", &self.inner.threads)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

pub struct DecodeContextBuilder {
    engine: Arc<dyn DecodeEngine>,
    memory_limit: i64,
    threads: Option<usize>,
    strategy: DecodeStrategy,
}

impl DecodeContextBuilder {
    /// Byte budget; negative means unbounded.
    pub fn memory_limit(mut self, limit: i64) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Size of the shared pool. Defaults to the available parallelism.
    pub fn threads(mut self, count: usize) -> Self {
        self.threads = Some(count);
        self
    }

    pub fn strategy(mut self, strategy: DecodeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> Result<DecodeContext, DecodeError> {
        let thread_count = match self.threads {
            Some(count) => count,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };
        let threads = match thread_count {
            0 => None,
            count => Some(ThreadEnv::new(count)?),
        };

        MESSAGE_SINKS.call_once(|| {
            debug!("installing engine message sinks");
            self.engine.install_message_sinks(&WARNINGS, &ERRORS);
        });

        info!(
            memory_limit = self.memory_limit,
            threads = thread_count,
            strategy = ?self.strategy,
            "decode context created"
        );
        Ok(DecodeContext {
            inner: Arc::new(ContextInner {
                engine: self.engine,
                memory: MemoryBroker::new(self.memory_limit),
                threads,
                strategy: self.strategy,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::CodestreamHeader;
    use crate::container::ChannelMapping;
    use crate::engine::{EngineSession, ExpansionLimits, StartRequest};

    struct NullEngine;

    impl DecodeEngine for NullEngine {
        fn expansion_limits(&self, _: &CodestreamHeader, _: &ChannelMapping, _: u32) -> ExpansionLimits {
            ExpansionLimits::default()
        }

        fn start<'a>(&self, _: StartRequest<'a>) -> Result<Box<dyn EngineSession + 'a>, DecodeError> {
            Err(DecodeError::CodecFault { code: 7 })
        }
    }

    #[test]
    fn test_reservations_release_on_drop() {
        let broker = MemoryBroker::new(1000);
        let first = broker.reserve(600).unwrap();
        assert_eq!(broker.in_use(), 600);
        let err = broker.reserve(500).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MemoryExhausted {
                requested: 500,
                limit: 1000
            }
        ));
        drop(first);
        let second = broker.reserve(1000).unwrap();
        assert_eq!(second.bytes(), 1000);
        drop(second);
        assert_eq!(broker.in_use(), 0);
        assert_eq!(broker.peak(), 1000);
    }

    #[test]
    fn test_negative_limit_is_unbounded() {
        let broker = MemoryBroker::new(-1);
        assert_eq!(broker.limit(), None);
        let _huge = broker.reserve(u64::MAX / 2).unwrap();
        assert_eq!(broker.in_use(), u64::MAX / 2);
    }

    #[test]
    fn test_clones_share_state() {
        let context = DecodeContext::new(Arc::new(NullEngine), 4096, 2).unwrap();
        let clone = context.clone();
        let _held = context.memory().reserve(100).unwrap();
        assert_eq!(clone.memory().in_use(), 100);
        assert_eq!(clone.threads().map(ThreadEnv::threads), Some(2));
    }

    #[test]
    fn test_zero_threads_decodes_inline() {
        let context = DecodeContext::new(Arc::new(NullEngine), -1, 0).unwrap();
        assert!(context.threads().is_none());
        assert!(context.session_threads().unwrap().is_none());
    }

    #[test]
    fn test_session_threading_builds_private_pool() {
        let context = DecodeContext::builder(Arc::new(NullEngine))
            .threads(1)
            .strategy(DecodeStrategy {
                threading: Threading::Session(3),
                ..Default::default()
            })
            .build()
            .unwrap();
        let session = context.session_threads().unwrap().unwrap();
        assert_eq!(session.threads(), 3);
        assert_eq!(session.install(|| 6 * 7), 42);
    }
}
