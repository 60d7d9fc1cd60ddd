//! The seam a wavelet decode engine plugs into.
//!
//! The crate parses containers, derives decode parameters and drives the
//! incremental decode; entropy decoding and the inverse transform belong to
//! a [`DecodeEngine`] implementation.

use crate::codestream::CodestreamHeader;
use crate::container::ChannelMapping;
use crate::context::{MemoryBroker, ThreadEnv};
use crate::error::DecodeError;
use crate::logging::EngineLogger;
use crate::source::StreamingSource;
use crate::{Coords, Region};

/// Bounds on the rational expansion factors an engine accepts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpansionLimits {
    /// Smallest allowed product of the horizontal and vertical factors.
    pub min_product: f64,
    /// Largest allowed horizontal factor.
    pub max_x: f64,
    /// Largest allowed vertical factor.
    pub max_y: f64,
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        Self {
            min_product: 0.0,
            max_x: f64::MAX,
            max_y: f64::MAX,
        }
    }
}

/// Everything an engine needs to start decoding one region.
pub struct StartRequest<'a> {
    pub codestream: &'a CodestreamHeader,
    /// Source the engine pulls compressed bytes through, from any thread.
    pub source: &'a StreamingSource,
    pub channels: &'a ChannelMapping,
    pub discard_level: u32,
    /// Upper bound on samples produced per `process` call.
    pub block_budget: usize,
    /// Region at the discarded resolution, before rational resampling.
    pub render_dims: Region,
    pub output_size: Coords,
    pub numerator: Coords,
    pub denominator: Coords,
    pub precise: bool,
    pub fastest: bool,
    /// Worker pool for parallel block decode; `None` decodes on the calling
    /// thread.
    pub threads: Option<ThreadEnv>,
    /// Allocations for in-flight decode state go through the broker.
    pub memory: MemoryBroker,
}

pub trait DecodeEngine: Send + Sync {
    /// Expansion bounds the engine accepts at `discard_level`.
    fn expansion_limits(
        &self,
        codestream: &CodestreamHeader,
        channels: &ChannelMapping,
        discard_level: u32,
    ) -> ExpansionLimits;

    fn start<'a>(&self, request: StartRequest<'a>) -> Result<Box<dyn EngineSession + 'a>, DecodeError>;

    /// Called once per process with the sinks engine diagnostics go to.
    fn install_message_sinks(&self, _warnings: &'static EngineLogger, _errors: &'static EngineLogger) {}
}

/// One incremental decode in progress.
pub trait EngineSession: Send {
    /// Decodes into `buffer`, one packed sample per pixel with rows of the
    /// produced rectangle's width. Shrinks `incomplete` by what was produced
    /// and returns the produced rectangle, relative to the output origin.
    fn process(&mut self, buffer: &mut [i32], incomplete: &mut Region) -> Result<Region, DecodeError>;

    /// Releases engine state. Returns the terminal error code, 0 on success.
    fn finish(&mut self) -> i32;
}
