//! Blocking byte source over an asynchronous reader.
//!
//! A wavelet decoder pulls compressed bytes synchronously, often from its own
//! worker threads, while the bytes themselves come from an asynchronous reader
//! (a file, an HTTP range fetcher, an object store). [`StreamingSource`] drives
//! the reader's futures to completion on the calling thread and serializes
//! concurrent callers behind one lock.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{Instrument, debug, error, info_span, trace, trace_span};

use crate::error::DecodeError;

/// An asynchronous reader of a byte range.
///
/// `read` returns at most `max_bytes` bytes; an empty result signals end of
/// stream. Retry policy, if any, belongs to the implementation.
pub trait RangeReader: Send {
    fn read(&mut self, max_bytes: usize) -> BoxFuture<'_, io::Result<Bytes>>;
    fn seek(&mut self, offset: u64) -> BoxFuture<'_, io::Result<()>>;
}

/// [`RangeReader`] over any tokio reader, e.g. `tokio::fs::File` or
/// `std::io::Cursor`.
pub struct AsyncIoReader<R> {
    inner: R,
}

impl<R> AsyncIoReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> RangeReader for AsyncIoReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    fn read(&mut self, max_bytes: usize) -> BoxFuture<'_, io::Result<Bytes>> {
        async move {
            let mut buffer = vec![0u8; max_bytes];
            let read = self.inner.read(&mut buffer).await?;
            buffer.truncate(read);
            Ok::<_, io::Error>(Bytes::from(buffer))
        }
        .boxed()
    }

    fn seek(&mut self, offset: u64) -> BoxFuture<'_, io::Result<()>> {
        async move {
            self.inner.seek(io::SeekFrom::Start(offset)).await?;
            Ok::<_, io::Error>(())
        }
        .boxed()
    }
}

/// Result of a [`StreamingSource::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// A non-blocking fetch was requested; no data is available without blocking.
    WouldBlock,
    /// Number of bytes written to the buffer. Zero signals end of stream.
    Bytes(usize),
}

/// When the source starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priming {
    /// Read only when a fetch asks for bytes.
    #[default]
    Lazy,
    /// Pre-read up to this many bytes on a background thread, so the first
    /// fetches are served without a round trip to the reader.
    Eager(usize),
}

enum Executor {
    Owned(Runtime),
    Shared(Handle),
}

impl Executor {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            Self::Owned(runtime) => runtime.block_on(future),
            Self::Shared(handle) => handle.block_on(future),
        }
    }
}

struct SourceState {
    reader: Box<dyn RangeReader>,
    position: u64,
    primed: Bytes,
    /// A failure of the priming read, reported by the next fetch.
    pending: Option<DecodeError>,
}

enum PrimeWorker {
    Idle,
    Running(JoinHandle<()>),
    Done,
}

/// Builder for a [`StreamingSource`].
pub struct StreamingSourceBuilder {
    reader: Box<dyn RangeReader>,
    handle: Option<Handle>,
    priming: Priming,
    name: Option<String>,
}

impl StreamingSourceBuilder {
    /// Drive the reader on an existing runtime instead of a private
    /// current-thread runtime.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn priming(mut self, priming: Priming) -> Self {
        self.priming = priming;
        self
    }

    /// Label used in tracing spans.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<StreamingSource, DecodeError> {
        let executor = match self.handle {
            Some(handle) => Executor::Shared(handle),
            None => Executor::Owned(Builder::new_current_thread().enable_all().build()?),
        };

        let source = StreamingSource {
            state: Arc::new(Mutex::new(SourceState {
                reader: self.reader,
                position: 0,
                primed: Bytes::new(),
                pending: None,
            })),
            executor: Arc::new(executor),
            priming: Mutex::new(PrimeWorker::Idle),
            span: info_span!("streaming_source", name = self.name.as_deref().unwrap_or("source")),
        };

        if let Priming::Eager(bytes) = self.priming {
            source.prime(bytes)?;
        }
        Ok(source)
    }
}

/// Synchronous, thread-safe adapter over a [`RangeReader`].
///
/// Must not be called from inside an asynchronous task: every blocking fetch
/// blocks the calling thread until the reader's future resolves. Callers
/// running on an async runtime should move decoding onto `spawn_blocking`.
pub struct StreamingSource {
    state: Arc<Mutex<SourceState>>,
    executor: Arc<Executor>,
    priming: Mutex<PrimeWorker>,
    span: tracing::Span,
}

impl StreamingSource {
    pub fn new(reader: impl RangeReader + 'static) -> Result<Self, DecodeError> {
        Self::builder(reader).build()
    }

    pub fn from_async_read<R>(reader: R) -> Result<Self, DecodeError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        Self::new(AsyncIoReader::new(reader))
    }

    pub fn builder(reader: impl RangeReader + 'static) -> StreamingSourceBuilder {
        StreamingSourceBuilder {
            reader: Box::new(reader),
            handle: None,
            priming: Priming::Lazy,
            name: None,
        }
    }

    /// Starts pre-reading up to `bytes` bytes on a background thread and
    /// returns immediately. Does nothing if priming was already started.
    pub fn prime(&self, bytes: usize) -> Result<(), DecodeError> {
        let mut priming = self
            .priming
            .lock()
            .map_err(|_| DecodeError::ContractViolation("priming lock poisoned".into()))?;
        if !matches!(*priming, PrimeWorker::Idle) || bytes == 0 {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let executor = Arc::clone(&self.executor);
        let span = self.span.clone();
        let worker = std::thread::Builder::new()
            .name("jpegexp-prime".into())
            .spawn(move || {
                let _entered = span.enter();
                let Ok(mut guard) = state.lock() else {
                    return;
                };
                let state = &mut *guard;
                match executor.block_on(state.reader.read(bytes)) {
                    Ok(data) if data.len() <= bytes => {
                        debug!(primed = data.len(), "source primed");
                        state.primed = data;
                    }
                    Ok(data) => {
                        state.pending = Some(oversized_read(data.len(), bytes));
                    }
                    Err(err) => {
                        error!(?err, "priming read failed");
                        state.pending = Some(err.into());
                    }
                }
            })?;
        *priming = PrimeWorker::Running(worker);
        Ok(())
    }

    /// Fetches up to `buffer.len()` bytes.
    ///
    /// A non-blocking fetch always returns [`Fetch::WouldBlock`]; a blocking
    /// fetch performs exactly one read of the underlying reader, unless primed
    /// bytes are available.
    pub fn fetch(&self, buffer: &mut [u8], blocking: bool) -> Result<Fetch, DecodeError> {
        if !blocking {
            return Ok(Fetch::WouldBlock);
        }

        let read_span = trace_span!(parent: &self.span, "read", requested = buffer.len());
        let _entered = read_span.enter();

        let mut guard = self.lock()?;
        let state = &mut *guard;
        if let Some(err) = state.pending.take() {
            return Err(err);
        }

        if !state.primed.is_empty() {
            let served = buffer.len().min(state.primed.len());
            let chunk = state.primed.split_to(served);
            buffer[..served].copy_from_slice(&chunk);
            state.position += served as u64;
            trace!(size = served, "read served from primed bytes");
            return Ok(Fetch::Bytes(served));
        }

        let data = self
            .executor
            .block_on(state.reader.read(buffer.len()).instrument(read_span.clone()))
            .inspect(|data| trace!(size = data.len(), "read fulfilled"))
            .inspect_err(|err| error!(?err, "read failed"))?;

        if data.len() > buffer.len() || i64::try_from(data.len()).is_err() {
            return Err(oversized_read(data.len(), buffer.len()));
        }
        buffer[..data.len()].copy_from_slice(&data);
        state.position += data.len() as u64;
        Ok(Fetch::Bytes(data.len()))
    }

    /// Fills `buffer` with blocking fetches until it is full or the stream
    /// ends. Returns the number of bytes written.
    pub fn fill(&self, buffer: &mut [u8]) -> Result<usize, DecodeError> {
        let mut filled = 0;
        while filled < buffer.len() {
            match self.fetch(&mut buffer[filled..], true)? {
                Fetch::Bytes(0) | Fetch::WouldBlock => break,
                Fetch::Bytes(read) => filled += read,
            }
        }
        Ok(filled)
    }

    /// Moves the cursor to `offset`. Seeks that land inside the primed bytes
    /// are served without touching the reader.
    pub fn seek(&self, offset: u64) -> Result<(), DecodeError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if let Some(err) = state.pending.take() {
            return Err(err);
        }

        let primed_end = state.position + state.primed.len() as u64;
        if !state.primed.is_empty() && offset >= state.position && offset <= primed_end {
            let skip = (offset - state.position) as usize;
            let _ = state.primed.split_to(skip);
            state.position = offset;
            return Ok(());
        }

        self.executor
            .block_on(state.reader.seek(offset).instrument(self.span.clone()))
            .inspect_err(|err| error!(?err, offset, "seek failed"))?;
        state.primed = Bytes::new();
        state.position = offset;
        Ok(())
    }

    /// Advances the cursor by `count` bytes.
    pub fn skip(&self, count: u64) -> Result<(), DecodeError> {
        self.seek(self.position() + count)
    }

    /// The adapter's own cursor: bytes delivered by `fetch` plus seeks.
    pub fn position(&self) -> u64 {
        match self.state.lock() {
            Ok(state) => state.position,
            Err(poisoned) => poisoned.into_inner().position,
        }
    }

    /// Waits for an outstanding priming read so primed bytes are never
    /// overtaken by a direct read.
    fn join_priming(&self) -> Result<(), DecodeError> {
        let mut priming = self
            .priming
            .lock()
            .map_err(|_| DecodeError::ContractViolation("priming lock poisoned".into()))?;
        if let PrimeWorker::Running(worker) = std::mem::replace(&mut *priming, PrimeWorker::Done) {
            worker
                .join()
                .map_err(|_| DecodeError::ContractViolation("priming read panicked".into()))?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, SourceState>, DecodeError> {
        self.join_priming()?;
        self.state
            .lock()
            .map_err(|_| DecodeError::ContractViolation("reader panicked during a fetch".into()))
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        let priming = match self.priming.get_mut() {
            Ok(priming) => priming,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let PrimeWorker::Running(worker) = std::mem::replace(priming, PrimeWorker::Done) {
            let _ = worker.join();
        }
    }
}

fn oversized_read(returned: usize, requested: usize) -> DecodeError {
    DecodeError::ContractViolation(format!(
        "reader returned {returned} bytes for a {requested} byte request"
    ))
}
