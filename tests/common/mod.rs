//! Shared fixtures: a synthetic decode engine that pulls bytes through the
//! streaming source and emits row stripes, and builders for J2K/JP2 bytes.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;

use jpegexp_stream::logging::EngineLogger;
use jpegexp_stream::{
    ChannelMapping, CodestreamHeader, Coords, DecodeContext, DecodeEngine, DecodeError,
    EngineSession, ExpansionLimits, ImageHandle, RangeReader, Region, Reservation, StartRequest,
    StreamingSource, ThreadEnv,
};

/// Bytes each `process` call pulls from the tile data.
pub const FETCH_PER_CALL: usize = 64;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The value the stripe engine writes for output pixel `(x, y)`.
pub fn pixel(x: u32, y: u32) -> i32 {
    ((y << 16) | x) as i32
}

/// What the engine was started with.
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub discard_level: u32,
    pub render_dims: Region,
    pub output_size: Coords,
    pub numerator: Coords,
    pub denominator: Coords,
    pub block_budget: usize,
    pub threads: Option<usize>,
}

/// Decodes nothing; produces whole output rows top to bottom, fetching
/// [`FETCH_PER_CALL`] bytes of tile data per call.
#[derive(Default)]
pub struct StripeEngine {
    pub limits: ExpansionLimits,
    /// Fail the n-th `process` call (1-based) with `fault_code`.
    pub fault_on_call: Option<usize>,
    pub fault_code: i32,
    /// Code returned from `finish`.
    pub finish_code: i32,
    /// Report a rectangle outside the incomplete region.
    pub overreach: bool,
    pub stats: Arc<EngineStats>,
}

/// Observations shared between the engine and its sessions.
#[derive(Default)]
pub struct EngineStats {
    pub starts: Mutex<Vec<StartRecord>>,
    pub finished: AtomicUsize,
    /// Names of the threads tile data was fetched on.
    pub fetch_threads: Mutex<Vec<String>>,
}

impl StripeEngine {
    pub fn last_start(&self) -> Option<StartRecord> {
        self.stats.starts.lock().unwrap().last().cloned()
    }

    pub fn finished(&self) -> usize {
        self.stats.finished.load(Ordering::SeqCst)
    }

    pub fn fetch_threads(&self) -> Vec<String> {
        self.stats.fetch_threads.lock().unwrap().clone()
    }
}

impl DecodeEngine for StripeEngine {
    fn expansion_limits(&self, _: &CodestreamHeader, _: &ChannelMapping, _: u32) -> ExpansionLimits {
        self.limits
    }

    fn start<'a>(&self, request: StartRequest<'a>) -> Result<Box<dyn EngineSession + 'a>, DecodeError> {
        let bytes = request.output_size.x as u64 * request.output_size.y as u64 * 4;
        let reservation = request.memory.reserve(bytes)?;
        self.stats.starts.lock().unwrap().push(StartRecord {
            discard_level: request.discard_level,
            render_dims: request.render_dims,
            output_size: request.output_size,
            numerator: request.numerator,
            denominator: request.denominator,
            block_budget: request.block_budget,
            threads: request.threads.as_ref().map(ThreadEnv::threads),
        });

        Ok(Box::new(StripeSession {
            source: request.source,
            tile_data: request.codestream.first_tile_offset,
            width: request.output_size.x,
            budget: request.block_budget,
            threads: request.threads,
            _reservation: reservation,
            calls: 0,
            fault_on_call: self.fault_on_call,
            fault_code: self.fault_code,
            finish_code: self.finish_code,
            overreach: self.overreach,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn install_message_sinks(&self, warnings: &'static EngineLogger, _errors: &'static EngineLogger) {
        warnings.message("stripe engine ready");
    }
}

struct StripeSession<'a> {
    source: &'a StreamingSource,
    tile_data: u64,
    width: u32,
    budget: usize,
    threads: Option<ThreadEnv>,
    _reservation: Reservation,
    calls: usize,
    fault_on_call: Option<usize>,
    fault_code: i32,
    finish_code: i32,
    overreach: bool,
    stats: Arc<EngineStats>,
}

impl StripeSession<'_> {
    fn fetch_tile_data(&self) -> Result<String, DecodeError> {
        let offset = self.tile_data + ((self.calls - 1) * FETCH_PER_CALL) as u64;
        self.source.seek(offset)?;
        let mut chunk = [0u8; FETCH_PER_CALL];
        self.source.fill(&mut chunk)?;
        Ok(std::thread::current().name().unwrap_or("unnamed").to_string())
    }
}

impl EngineSession for StripeSession<'_> {
    fn process(&mut self, buffer: &mut [i32], incomplete: &mut Region) -> Result<Region, DecodeError> {
        self.calls += 1;
        if self.fault_on_call == Some(self.calls) {
            return Err(DecodeError::CodecFault { code: self.fault_code });
        }
        if incomplete.is_empty() {
            return Ok(Region::default());
        }

        let thread = match &self.threads {
            Some(threads) => threads.install(|| self.fetch_tile_data())?,
            None => self.fetch_tile_data()?,
        };
        self.stats.fetch_threads.lock().unwrap().push(thread);

        let width = self.width as usize;
        let rows = (buffer.len() / width)
            .min(self.budget / width)
            .min(incomplete.height as usize) as u32;
        if rows == 0 {
            return Ok(Region::default());
        }

        for row in 0..rows {
            let y = incomplete.y + row;
            let line = &mut buffer[row as usize * width..(row as usize + 1) * width];
            for (x, sample) in line.iter_mut().enumerate() {
                *sample = pixel(x as u32, y);
            }
        }

        let produced = Region::new(0, incomplete.y, self.width, rows);
        incomplete.y += rows;
        incomplete.height -= rows;
        if self.overreach {
            return Ok(Region::new(0, produced.y, self.width + 1, rows));
        }
        Ok(produced)
    }

    fn finish(&mut self) -> i32 {
        self.stats.finished.fetch_add(1, Ordering::SeqCst);
        self.finish_code
    }
}

/// A reader over in-memory bytes that fails every read at or past `fail_at`.
pub struct FailingReader {
    data: Vec<u8>,
    position: u64,
    fail_at: u64,
}

impl FailingReader {
    pub fn new(data: Vec<u8>, fail_at: u64) -> Self {
        Self {
            data,
            position: 0,
            fail_at,
        }
    }
}

impl RangeReader for FailingReader {
    fn read(&mut self, max_bytes: usize) -> BoxFuture<'_, io::Result<Bytes>> {
        async move {
            if self.position >= self.fail_at {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "range request failed"));
            }
            let start = (self.position as usize).min(self.data.len());
            let end = (start + max_bytes)
                .min(self.data.len())
                .min(self.fail_at as usize);
            self.position = end as u64;
            Ok(Bytes::copy_from_slice(&self.data[start..end]))
        }
        .boxed()
    }

    fn seek(&mut self, offset: u64) -> BoxFuture<'_, io::Result<()>> {
        self.position = offset;
        async { Ok(()) }.boxed()
    }
}

/// Main header and one tile-part of a J2K codestream.
pub struct CodestreamSpec {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub components: u16,
    pub levels: u8,
    /// Bytes of tile data after SOD.
    pub tile_bytes: usize,
}

impl CodestreamSpec {
    pub fn new(width: u32, height: u32, levels: u8) -> Self {
        Self {
            width,
            height,
            tile_width: width,
            tile_height: height,
            components: 3,
            levels,
            tile_bytes: 1024,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = vec![0xFF, 0x4F];

        data.extend_from_slice(&[0xFF, 0x51]);
        data.extend_from_slice(&(38 + 3 * self.components).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]);
        for value in [
            self.width,
            self.height,
            0,
            0,
            self.tile_width,
            self.tile_height,
            0,
            0,
        ] {
            data.extend_from_slice(&value.to_be_bytes());
        }
        data.extend_from_slice(&self.components.to_be_bytes());
        for _ in 0..self.components {
            data.extend_from_slice(&[0x07, 0x01, 0x01]);
        }

        data.extend_from_slice(&[0xFF, 0x52, 0x00, 0x0C, 0x00, 0x02, 0x00, 0x01, 0x01]);
        data.extend_from_slice(&[self.levels, 0x04, 0x04, 0x00, 0x01]);
        data.extend_from_slice(&[0xFF, 0x5C, 0x00, 0x04, 0x40, 0x48]);
        data.extend_from_slice(&[0xFF, 0x64, 0x00, 0x08, 0x00, 0x01, b't', b'e', b's', b't']);

        let psot = (12 + 2 + self.tile_bytes) as u32;
        data.extend_from_slice(&[0xFF, 0x90, 0x00, 0x0A, 0x00, 0x00]);
        data.extend_from_slice(&psot.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x01, 0xFF, 0x93]);
        data.extend((0..self.tile_bytes).map(|i| (i % 251) as u8));
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }
}

fn jp2_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut data = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    data.extend_from_slice(fourcc);
    data.extend_from_slice(payload);
    data
}

/// Wraps a codestream in a minimal sRGB JP2 file.
pub fn jp2(spec: &CodestreamSpec) -> Vec<u8> {
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&spec.height.to_be_bytes());
    ihdr.extend_from_slice(&spec.width.to_be_bytes());
    ihdr.extend_from_slice(&spec.components.to_be_bytes());
    ihdr.extend_from_slice(&[0x07, 0x07, 0x00, 0x00]);
    let colr = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10];
    let mut header = jp2_box(b"ihdr", &ihdr);
    header.extend(jp2_box(b"colr", &colr));

    let mut data = b"\x00\x00\x00\x0CjP  \r\n\x87\n".to_vec();
    data.extend(jp2_box(b"ftyp", b"jp2 \x00\x00\x00\x00jp2 "));
    data.extend(jp2_box(b"jp2h", &header));
    data.extend(jp2_box(b"jp2c", &spec.build()));
    data
}

pub fn context(engine: Arc<StripeEngine>, threads: usize) -> DecodeContext {
    DecodeContext::new(engine, -1, threads).unwrap()
}

pub fn open(context: &DecodeContext, data: Vec<u8>) -> ImageHandle {
    let source = StreamingSource::from_async_read(std::io::Cursor::new(data)).unwrap();
    ImageHandle::open(context, source).unwrap()
}

/// Drives a decompressor to completion with a buffer of `buffer_len`
/// samples, checking that the delivered rectangles tile the output exactly
/// and carry the expected samples.
pub fn decode_all(
    decompressor: &mut jpegexp_stream::RegionDecompressor<'_>,
    buffer_len: usize,
) -> Vec<Region> {
    let output = decompressor.output_size();
    let mut covered = vec![false; output.x as usize * output.y as usize];
    let mut buffer = vec![0i32; buffer_len];
    let mut delivered = Vec::new();

    loop {
        let processed = decompressor.process(&mut buffer).unwrap();
        let rect = processed.region;
        for row in 0..rect.height {
            for col in 0..rect.width {
                let (x, y) = (rect.x + col, rect.y + row);
                let index = y as usize * output.x as usize + x as usize;
                assert!(!covered[index], "pixel ({x}, {y}) delivered twice");
                covered[index] = true;
                assert_eq!(buffer[(row * rect.width + col) as usize], pixel(x, y));
            }
        }
        if !rect.is_empty() {
            delivered.push(rect);
        }
        if !processed.more_pending {
            break;
        }
    }

    assert!(covered.iter().all(|&c| c), "output not fully covered");
    delivered
}
