use tracing::{debug, info, info_span};

use crate::codestream::CodestreamHeader;
use crate::container::{ChannelMapping, ContainerParser, Jp2Container};
use crate::context::DecodeContext;
use crate::decompressor::RegionDecompressor;
use crate::error::DecodeError;
use crate::source::{Priming, StreamingSource};
use crate::{Info, Region};

/// One open image: its source, its first codestream and the static
/// properties derived from them.
///
/// Decompressors borrow the handle mutably, so a handle serves one region
/// decode at a time and outlives every decode started from it.
pub struct ImageHandle {
    context: DecodeContext,
    source: StreamingSource,
    codestream: CodestreamHeader,
    channels: ChannelMapping,
    info: Info,
    span: tracing::Span,
}

impl ImageHandle {
    /// Opens a JP2 file or raw J2K codestream.
    pub fn open(context: &DecodeContext, source: StreamingSource) -> Result<Self, DecodeError> {
        Self::open_with(context, source, Jp2Container::new(), "image")
    }

    /// Opens `source` with a caller-supplied container parser. `name` labels
    /// the handle's tracing span.
    pub fn open_with(
        context: &DecodeContext,
        source: StreamingSource,
        mut parser: impl ContainerParser,
        name: &str,
    ) -> Result<Self, DecodeError> {
        let span = info_span!("image_reader", image_name = name);
        let entered = span.enter();

        if let Priming::Eager(bytes) = context.strategy().priming {
            source.prime(bytes)?;
        }

        if !parser.open(&source)? {
            return Err(DecodeError::InvalidContainer("source is not a valid image object"));
        }
        if !parser.read_header(&source)? || parser.codestream_count() == 0 {
            return Err(DecodeError::InvalidContainer("unable to handle image contents"));
        }

        let (codestream, channels) = match (parser.access_codestream(0), parser.channel_mapping(0)) {
            (Some(codestream), Some(channels)) => (codestream.clone(), channels.clone()),
            _ => return Err(DecodeError::InvalidContainer("image has no codestream")),
        };

        let info = Info::from_codestream(&codestream, &channels)?;
        info!(?info, channels = channels.num_channels(), "image opened");

        drop(entered);
        Ok(Self {
            context: context.clone(),
            source,
            codestream,
            channels,
            info,
            span,
        })
    }

    pub fn info(&self) -> Info {
        self.info
    }

    pub fn codestream(&self) -> &CodestreamHeader {
        &self.codestream
    }

    pub fn channels(&self) -> &ChannelMapping {
        &self.channels
    }

    pub fn context(&self) -> &DecodeContext {
        &self.context
    }

    pub fn source(&self) -> &StreamingSource {
        &self.source
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Starts decoding `region` at native resolution.
    pub fn open_region(&mut self, region: Region) -> Result<RegionDecompressor<'_>, DecodeError> {
        RegionDecompressor::start(self, region, None)
    }

    /// Starts decoding `region` resampled to about `scaled_width` by
    /// `scaled_height` pixels.
    pub fn open_region_scaled(
        &mut self,
        region: Region,
        scaled_width: u32,
        scaled_height: u32,
    ) -> Result<RegionDecompressor<'_>, DecodeError> {
        RegionDecompressor::start(self, region, Some((scaled_width, scaled_height)))
    }
}

impl Info {
    /// Derives the image properties from a parsed codestream: the size of
    /// the reference component, the first tile on the canvas and the depth
    /// every component can be discarded to.
    pub fn from_codestream(
        codestream: &CodestreamHeader,
        channels: &ChannelMapping,
    ) -> Result<Self, DecodeError> {
        let dims = codestream
            .component_dims(channels.reference_component())
            .ok_or(DecodeError::InvalidContainer("reference component out of range"))?;
        let tile = codestream.tile_dims(0, 0);
        Ok(Self {
            width: dims.width,
            height: dims.height,
            tile_width: tile.width,
            tile_height: tile.height,
            dwt_levels: codestream.min_dwt_levels(),
        })
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        debug!("codestream released");
    }
}
