//! JP2 box structure (ISO/IEC 15444-1 Annex I) and raw codestream detection.

use tracing::{debug, trace};

use crate::codestream::{CodestreamHeader, CodestreamParser};
use crate::error::DecodeError;
use crate::marker::{BoxType, ENUMCS_GREYSCALE, ENUMCS_SRGB, ENUMCS_SYCC, J2kMarker, JP2_SIGNATURE};
use crate::source::StreamingSource;
use crate::stream_reader::SourceReader;

/// Parses a compressed container far enough to locate its codestreams.
///
/// Implementations read through the [`StreamingSource`] they are given and
/// should read no more than the headers require.
pub trait ContainerParser: Send {
    /// Checks that the bytes start a supported container. `Ok(false)` means
    /// the format is not recognised.
    fn open(&mut self, source: &StreamingSource) -> Result<bool, DecodeError>;

    /// Reads the container and codestream headers. `Ok(false)` means the
    /// container holds no decodable codestream.
    fn read_header(&mut self, source: &StreamingSource) -> Result<bool, DecodeError>;

    fn codestream_count(&self) -> usize;

    fn access_codestream(&self, index: usize) -> Option<&CodestreamHeader>;

    /// How codestream components map to output channels.
    fn channel_mapping(&self, index: usize) -> Option<&ChannelMapping>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColourSpace {
    Srgb,
    Greyscale,
    Sycc,
    Unknown,
}

impl ColourSpace {
    fn from_enumcs(enumcs: u32) -> Self {
        match enumcs {
            ENUMCS_SRGB => Self::Srgb,
            ENUMCS_GREYSCALE => Self::Greyscale,
            ENUMCS_SYCC => Self::Sycc,
            _ => Self::Unknown,
        }
    }

    /// Number of colour channels, excluding alpha.
    pub fn colour_channels(self) -> usize {
        match self {
            Self::Greyscale => 1,
            Self::Srgb | Self::Sycc => 3,
            Self::Unknown => 1,
        }
    }
}

/// Which codestream components feed which output channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapping {
    pub colour_space: ColourSpace,
    /// Codestream component index for each output channel; a trailing extra
    /// entry is the alpha channel.
    pub source_components: Vec<usize>,
}

impl ChannelMapping {
    /// Maps components for a codestream, using the container's colour space
    /// when it declares one.
    pub fn configure(header: &CodestreamHeader, colour: Option<ColourSpace>) -> Self {
        let available = header.components.len();
        let colour_space = colour.unwrap_or(if available >= 3 {
            ColourSpace::Srgb
        } else {
            ColourSpace::Greyscale
        });

        let mut channels = colour_space.colour_channels();
        if channels > available {
            channels = 1;
        }
        if available > channels {
            // One extra component is treated as alpha.
            channels += 1;
        }
        Self {
            colour_space,
            source_components: (0..channels).collect(),
        }
    }

    /// The component whose geometry defines the image size.
    pub fn reference_component(&self) -> usize {
        self.source_components.first().copied().unwrap_or(0)
    }

    pub fn num_channels(&self) -> usize {
        self.source_components.len()
    }

    pub fn has_alpha(&self) -> bool {
        self.num_channels() > self.colour_space.colour_channels()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    RawCodestream,
    Jp2,
}

/// A box header: the type, where its payload starts, and where it ends
/// (`None` when the box extends to the end of the source).
struct Jp2Box {
    box_type: u32,
    data_start: u64,
    data_end: Option<u64>,
}

/// JP2 files and raw J2K codestreams.
#[derive(Debug, Default)]
pub struct Jp2Container {
    kind: Option<ContainerKind>,
    colour: Option<ColourSpace>,
    /// Component count declared by `ihdr`.
    declared_components: Option<u16>,
    codestream: Option<(CodestreamHeader, ChannelMapping)>,
}

impl Jp2Container {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_box(reader: &mut SourceReader<'_>) -> Result<Jp2Box, DecodeError> {
        let start = reader.offset();
        let mut length = reader.read_u32()? as u64;
        let box_type = reader.read_u32()?;
        let mut header_size = 8;

        if length == 1 {
            length = reader.read_u64()?;
            header_size += 8;
        }

        let data_end = match length {
            0 => None,
            len if len < header_size => {
                return Err(DecodeError::InvalidContainer("box length shorter than its header"));
            }
            len => Some(start + len),
        };

        Ok(Jp2Box {
            box_type,
            data_start: start + header_size,
            data_end,
        })
    }

    /// Walks boxes from the reader's position up to `end`, descending into
    /// superboxes. Returns once the first codestream has been parsed.
    fn read_boxes(&mut self, reader: &mut SourceReader<'_>, end: Option<u64>) -> Result<bool, DecodeError> {
        while end.is_none_or(|end| reader.offset() + 8 <= end) {
            let jp2_box = match Self::read_box(reader) {
                Ok(jp2_box) => jp2_box,
                // Running out of data between top-level boxes ends the file.
                Err(DecodeError::InvalidContainer(_)) if end.is_none() => return Ok(false),
                Err(err) => return Err(err),
            };

            match BoxType::try_from(jp2_box.box_type) {
                Ok(box_type) if box_type.is_superbox() => {
                    trace!(?box_type, "descending into superbox");
                    if self.read_boxes(reader, jp2_box.data_end)? {
                        return Ok(true);
                    }
                }
                Ok(BoxType::ImageHeader) => {
                    let _height = reader.read_u32()?;
                    let _width = reader.read_u32()?;
                    self.declared_components = Some(reader.read_u16()?);
                }
                Ok(BoxType::Colour) => {
                    let method = reader.read_u8()?;
                    let _precedence = reader.read_u8()?;
                    let _approximation = reader.read_u8()?;
                    // Only the first colr box is significant.
                    if method == 1 && self.colour.is_none() {
                        self.colour = Some(ColourSpace::from_enumcs(reader.read_u32()?));
                    }
                }
                Ok(BoxType::Codestream) => {
                    let mut header = CodestreamParser::new(reader).parse_main_header()?;
                    header.data_length = jp2_box.data_end.map(|end| end - jp2_box.data_start);
                    self.set_codestream(header)?;
                    return Ok(true);
                }
                other => trace!(box_type = ?other, "skipping box"),
            }

            match jp2_box.data_end {
                Some(box_end) => reader.seek(box_end)?,
                // Only the codestream box may run to the end of the file.
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    fn set_codestream(&mut self, header: CodestreamHeader) -> Result<(), DecodeError> {
        if self
            .declared_components
            .is_some_and(|declared| declared as usize != header.components.len())
        {
            return Err(DecodeError::InvalidContainer(
                "ihdr component count disagrees with the codestream",
            ));
        }
        let mapping = ChannelMapping::configure(&header, self.colour);
        debug!(
            components = header.components.len(),
            colour = ?mapping.colour_space,
            offset = header.data_offset,
            "located codestream"
        );
        self.codestream = Some((header, mapping));
        Ok(())
    }
}

impl ContainerParser for Jp2Container {
    fn open(&mut self, source: &StreamingSource) -> Result<bool, DecodeError> {
        source.seek(0)?;
        let mut signature = [0u8; 12];
        let read = source.fill(&mut signature)?;

        let soc = u16::from(J2kMarker::StartOfCodestream).to_be_bytes();
        self.kind = if read >= 2 && signature[..2] == soc {
            Some(ContainerKind::RawCodestream)
        } else if read == 12 && signature == JP2_SIGNATURE {
            Some(ContainerKind::Jp2)
        } else {
            None
        };
        Ok(self.kind.is_some())
    }

    fn read_header(&mut self, source: &StreamingSource) -> Result<bool, DecodeError> {
        if self.codestream.is_some() {
            return Ok(true);
        }
        match self.kind {
            Some(ContainerKind::RawCodestream) => {
                let mut reader = SourceReader::new(source, 0)?;
                let header = CodestreamParser::new(&mut reader).parse_main_header()?;
                self.set_codestream(header)?;
                Ok(true)
            }
            Some(ContainerKind::Jp2) => {
                let mut reader = SourceReader::new(source, JP2_SIGNATURE.len() as u64)?;
                self.read_boxes(&mut reader, None)
            }
            None => Ok(false),
        }
    }

    fn codestream_count(&self) -> usize {
        usize::from(self.codestream.is_some())
    }

    fn access_codestream(&self, index: usize) -> Option<&CodestreamHeader> {
        match (index, &self.codestream) {
            (0, Some((header, _))) => Some(header),
            _ => None,
        }
    }

    fn channel_mapping(&self, index: usize) -> Option<&ChannelMapping> {
        match (index, &self.codestream) {
            (0, Some((_, mapping))) => Some(mapping),
            _ => None,
        }
    }
}
