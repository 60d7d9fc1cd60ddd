//! Region-of-interest JPEG 2000 decoding over incremental byte sources.
//!
//! The crate bridges asynchronous, possibly network-backed readers into the
//! blocking fetch protocol of a streaming wavelet decoder, derives the discard
//! level and rational expansion factors for a requested output size, and drives
//! the decoder incrementally so decoded scanlines can be consumed before the
//! whole region is available.
//!
//! - `source`: [`StreamingSource`], the async-to-blocking byte source adapter.
//! - `context`: [`DecodeContext`], shared memory broker and worker pool.
//! - `container` / `codestream`: JP2 box and J2K main-header parsing.
//! - `image`: [`ImageHandle`], one open codestream and its [`Info`].
//! - `params`: [`DecodeParameters`] derivation.
//! - `decompressor`: [`RegionDecompressor`], the incremental state machine.
//! - `engine`: the [`DecodeEngine`] seam the wavelet decoder plugs into.
//! - `logging`: [`EngineLogger`] sinks bridging engine diagnostics to `tracing`.

pub mod codestream;
pub mod container;
pub mod context;
pub mod decompressor;
pub mod engine;
pub mod error;
pub mod image;
pub mod logging;
pub mod marker;
pub mod params;
pub mod source;
pub mod stream_reader;

pub use codestream::{CodestreamHeader, ComponentInfo};
pub use container::{ChannelMapping, ColourSpace, ContainerParser, Jp2Container};
pub use context::{
    DecodeContext, DecodeContextBuilder, DecodeStrategy, MemoryBroker, Reservation, ThreadEnv,
    Threading,
};
pub use decompressor::{PROCESS_BLOCK_SAMPLES, Processed, RegionDecompressor};
pub use engine::{DecodeEngine, EngineSession, ExpansionLimits, StartRequest};
pub use error::DecodeError;
pub use image::ImageHandle;
pub use logging::{EngineLogger, LogLevel};
pub use params::{DecodeParameters, DiscardHeuristic};
pub use source::{AsyncIoReader, Fetch, Priming, RangeReader, StreamingSource};

/// An integer rectangle.
///
/// Regions requested by callers are in native image pixels; rectangles
/// reported by a decompressor are in output pixels relative to the output
/// origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Overlap of two rectangles; empty rectangles intersect nothing.
    pub fn intersect(&self, other: &Region) -> Region {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 as u64 || y1 <= y0 as u64 {
            return Region::default();
        }
        Region::new(x0, y0, (x1 - x0 as u64) as u32, (y1 - y0 as u64) as u32)
    }

    /// Whether `other` lies entirely within `self`. Empty rectangles are
    /// contained everywhere.
    pub fn contains(&self, other: &Region) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }
}

/// A per-axis pair, used for expansion numerators and denominators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Coords {
    pub x: u32,
    pub y: u32,
}

impl Coords {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Static properties of one image, fixed for the lifetime of its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Info {
    /// Width of the reference component in pixels.
    pub width: u32,
    /// Height of the reference component in pixels.
    pub height: u32,
    /// Width of the first tile on the high-resolution canvas.
    pub tile_width: u32,
    /// Height of the first tile on the high-resolution canvas.
    pub tile_height: u32,
    /// Maximum number of resolution levels that can be discarded.
    pub dwt_levels: u32,
}

impl Info {
    /// The full image as a region.
    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_intersect() {
        let image = Region::new(0, 0, 100, 80);
        assert_eq!(
            image.intersect(&Region::new(90, 70, 50, 50)),
            Region::new(90, 70, 10, 10)
        );
        assert!(image.intersect(&Region::new(100, 0, 10, 10)).is_empty());
        assert!(image.intersect(&Region::new(u32::MAX, 0, 10, 10)).is_empty());
    }

    #[test]
    fn test_region_contains() {
        let outer = Region::new(10, 10, 20, 20);
        assert!(outer.contains(&Region::new(10, 10, 20, 20)));
        assert!(outer.contains(&Region::new(15, 29, 5, 1)));
        assert!(!outer.contains(&Region::new(15, 29, 5, 2)));
        assert!(outer.contains(&Region::default()));
    }
}
