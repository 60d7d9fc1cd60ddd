//! JPEG 2000 codestream main-header parser.
//!
//! Reads SIZ, COD, COC, QCD, CAP and RGN segments up to the first tile-part
//! (SOT) and records where the codestream lives in the source. Tile data is
//! never read here; the decode engine pulls it later.

use crate::error::DecodeError;
use crate::marker::J2kMarker;
use crate::stream_reader::SourceReader;
use crate::Region;

/// Metadata for a single component from the SIZ marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentInfo {
    /// bit depth (e.g. 8, 12, 16)
    pub depth: u8,
    /// true if signed, false if unsigned
    pub is_signed: bool,
    /// Horizontal subsampling factor
    pub dx: u8,
    /// Vertical subsampling factor
    pub dy: u8,
}

/// Coding Style Default (COD) parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodingStyle {
    pub coding_style: u8,
    pub progression_order: u8,
    pub number_of_layers: u16,
    pub mct: u8,
    pub decomposition_levels: u8,
    pub codeblock_width_exp: u8,
    pub codeblock_height_exp: u8,
    pub codeblock_style: u8,
    /// 0 = irreversible 9-7, 1 = reversible 5-3.
    pub transformation: u8,
    pub precinct_sizes: Vec<u8>,
}

impl CodingStyle {
    pub fn progression_name(&self) -> &'static str {
        match self.progression_order {
            0 => "LRCP",
            1 => "RLCP",
            2 => "RPCL",
            3 => "PCRL",
            4 => "CPRL",
            _ => "Unknown",
        }
    }
}

/// Region of interest (RGN) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiShift {
    pub component_index: u16,
    pub roi_style: u8,
    pub shift_value: u8,
}

/// Main-header metadata of one codestream and its location in the source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodestreamHeader {
    /// Xsiz: right edge of the image area on the reference grid.
    pub grid_width: u32,
    /// Ysiz: bottom edge of the image area on the reference grid.
    pub grid_height: u32,
    pub x_origin: u32,
    pub y_origin: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_x_origin: u32,
    pub tile_y_origin: u32,
    pub components: Vec<ComponentInfo>,
    pub cod: Option<CodingStyle>,
    /// Decomposition level overrides from COC segments, by component.
    pub component_levels: Vec<(u16, u8)>,
    /// Sqcd from the QCD segment.
    pub quant_style: Option<u8>,
    /// Pcap from the CAP segment.
    pub pcap: Option<u32>,
    pub roi: Option<RoiShift>,
    /// Source offset of the SOC marker.
    pub data_offset: u64,
    /// Length of the codestream, when the container records it.
    pub data_length: Option<u64>,
    /// Source offset of the first SOT marker.
    pub first_tile_offset: u64,
}

impl CodestreamHeader {
    /// Image area on the high-resolution reference grid.
    pub fn canvas(&self) -> Region {
        Region::new(
            self.x_origin,
            self.y_origin,
            self.grid_width - self.x_origin,
            self.grid_height - self.y_origin,
        )
    }

    /// Image area of component `index`, accounting for its subsampling.
    pub fn component_dims(&self, index: usize) -> Option<Region> {
        let component = self.components.get(index)?;
        let dx = component.dx.max(1) as u32;
        let dy = component.dy.max(1) as u32;
        let x0 = self.x_origin.div_ceil(dx);
        let y0 = self.y_origin.div_ceil(dy);
        let x1 = self.grid_width.div_ceil(dx);
        let y1 = self.grid_height.div_ceil(dy);
        Some(Region::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn tiles_across(&self) -> u32 {
        (self.grid_width - self.tile_x_origin).div_ceil(self.tile_width.max(1))
    }

    pub fn tiles_down(&self) -> u32 {
        (self.grid_height - self.tile_y_origin).div_ceil(self.tile_height.max(1))
    }

    /// Area of tile `(tx, ty)` on the high-resolution reference grid,
    /// clipped to the image area.
    pub fn tile_dims(&self, tx: u32, ty: u32) -> Region {
        let x0 = self.tile_x_origin as u64 + tx as u64 * self.tile_width as u64;
        let y0 = self.tile_y_origin as u64 + ty as u64 * self.tile_height as u64;
        let tile = Region::new(
            x0.min(u32::MAX as u64) as u32,
            y0.min(u32::MAX as u64) as u32,
            self.tile_width,
            self.tile_height,
        );
        tile.intersect(&self.canvas())
    }

    /// Smallest number of wavelet decomposition levels over all components,
    /// i.e. the deepest discard every component supports.
    pub fn min_dwt_levels(&self) -> u32 {
        let default = self
            .cod
            .as_ref()
            .map(|cod| cod.decomposition_levels)
            .unwrap_or(0);
        self.component_levels
            .iter()
            .map(|&(_, levels)| levels)
            .fold(default, u8::min) as u32
    }

    /// Whether the codestream uses the HTJ2K block coder (Part 15).
    pub fn is_htj2k(&self) -> bool {
        // Pcap bit (32 - 15) flags Part 15 capabilities.
        self.pcap.is_some_and(|pcap| pcap & (1 << 17) != 0)
    }
}

/// A parser that transforms raw J2K marker segments into a [`CodestreamHeader`].
pub struct CodestreamParser<'r, 's> {
    reader: &'r mut SourceReader<'s>,
    header: CodestreamHeader,
}

impl<'r, 's> CodestreamParser<'r, 's> {
    pub fn new(reader: &'r mut SourceReader<'s>) -> Self {
        Self {
            reader,
            header: CodestreamHeader::default(),
        }
    }

    /// Parses the main header, starting at the SOC marker and stopping at the
    /// first SOT.
    pub fn parse_main_header(mut self) -> Result<CodestreamHeader, DecodeError> {
        self.header.data_offset = self.reader.offset();
        if self.reader.read_u16()? != u16::from(J2kMarker::StartOfCodestream) {
            return Err(DecodeError::InvalidContainer("codestream does not start with SOC"));
        }

        let mut seen_siz = false;
        loop {
            let code = self.reader.read_u16()?;
            if code >> 8 != 0xFF {
                return Err(DecodeError::InvalidContainer("expected a marker in the main header"));
            }

            match J2kMarker::try_from(code) {
                Ok(J2kMarker::ImageAndTileSize) => {
                    self.parse_siz()?;
                    seen_siz = true;
                }
                Ok(J2kMarker::CodingStyleDefault) => self.parse_cod()?,
                Ok(J2kMarker::CodingStyleComponent) => self.parse_coc()?,
                Ok(J2kMarker::QuantizationDefault) => self.parse_qcd()?,
                Ok(J2kMarker::Capability) => self.parse_cap()?,
                Ok(J2kMarker::RegionOfInterest) => self.parse_rgn()?,
                Ok(J2kMarker::StartOfTile) => {
                    self.header.first_tile_offset = self.reader.offset() - 2;
                    break;
                }
                Ok(marker) if marker.is_delimiting() => {
                    return Err(DecodeError::InvalidContainer("unexpected marker in the main header"));
                }
                // COM, TLM, PLM, QCC, POC, PPM, CRG and unknown segments.
                _ => self.skip_segment()?,
            }
        }

        if !seen_siz {
            return Err(DecodeError::InvalidContainer("codestream has no SIZ segment"));
        }
        Ok(self.header)
    }

    fn skip_segment(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()?;
        if len < 2 {
            return Err(DecodeError::InvalidContainer("invalid marker segment length"));
        }
        self.reader.advance((len - 2) as u64)
    }

    fn parse_siz(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()?;
        let _caps = self.reader.read_u16()?; // Rsiz
        self.header.grid_width = self.reader.read_u32()?;
        self.header.grid_height = self.reader.read_u32()?;
        self.header.x_origin = self.reader.read_u32()?;
        self.header.y_origin = self.reader.read_u32()?;
        self.header.tile_width = self.reader.read_u32()?;
        self.header.tile_height = self.reader.read_u32()?;
        self.header.tile_x_origin = self.reader.read_u32()?;
        self.header.tile_y_origin = self.reader.read_u32()?;

        let comps = self.reader.read_u16()?;
        if len as usize != 38 + 3 * comps as usize {
            return Err(DecodeError::InvalidContainer("SIZ length does not match component count"));
        }
        if comps == 0
            || self.header.grid_width <= self.header.x_origin
            || self.header.grid_height <= self.header.y_origin
            || self.header.tile_width == 0
            || self.header.tile_height == 0
            || self.header.tile_x_origin > self.header.x_origin
            || self.header.tile_y_origin > self.header.y_origin
        {
            return Err(DecodeError::InvalidContainer("SIZ geometry is inconsistent"));
        }

        self.header.components.clear();
        for _ in 0..comps {
            let depth_byte = self.reader.read_u8()?;
            let dx = self.reader.read_u8()?;
            let dy = self.reader.read_u8()?;
            if dx == 0 || dy == 0 {
                return Err(DecodeError::InvalidContainer("component subsampling is zero"));
            }
            self.header.components.push(ComponentInfo {
                depth: (depth_byte & 0x7F) + 1,
                is_signed: (depth_byte & 0x80) != 0,
                dx,
                dy,
            });
        }
        Ok(())
    }

    fn parse_cod(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()?;
        // 2 (length) + Scod, SGcod (4 bytes) and SPcod without precincts (5 bytes).
        if len < 12 {
            return Err(DecodeError::InvalidContainer("COD segment too short"));
        }
        let coding_style = self.reader.read_u8()?;
        let progression_order = self.reader.read_u8()?;
        let number_of_layers = self.reader.read_u16()?;
        let mct = self.reader.read_u8()?;
        let decomposition_levels = self.reader.read_u8()?;
        let codeblock_width_exp = self.reader.read_u8()?;
        let codeblock_height_exp = self.reader.read_u8()?;
        let codeblock_style = self.reader.read_u8()?;
        let transformation = self.reader.read_u8()?;

        let mut precinct_sizes = Vec::new();
        if (coding_style & 0x01) != 0 {
            for _ in 0..=decomposition_levels {
                precinct_sizes.push(self.reader.read_u8()?);
            }
        }

        let parsed = 12 + precinct_sizes.len() as u64;
        self.reader.advance((len as u64).saturating_sub(parsed))?;
        self.header.cod = Some(CodingStyle {
            coding_style,
            progression_order,
            number_of_layers,
            mct,
            decomposition_levels,
            codeblock_width_exp,
            codeblock_height_exp,
            codeblock_style,
            transformation,
            precinct_sizes,
        });
        Ok(())
    }

    fn parse_coc(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()? as u64;
        let wide_index = self.header.components.len() >= 257;
        let component = if wide_index {
            self.reader.read_u16()?
        } else {
            self.reader.read_u8()? as u16
        };
        let _scoc = self.reader.read_u8()?;
        let levels = self.reader.read_u8()?;

        let parsed = 2 + if wide_index { 2 } else { 1 } + 2;
        if len < parsed {
            return Err(DecodeError::InvalidContainer("COC segment too short"));
        }
        self.reader.advance(len - parsed)?;
        self.header.component_levels.retain(|&(c, _)| c != component);
        self.header.component_levels.push((component, levels));
        Ok(())
    }

    fn parse_qcd(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()?;
        if len < 3 {
            return Err(DecodeError::InvalidContainer("QCD segment too short"));
        }
        self.header.quant_style = Some(self.reader.read_u8()?);
        self.reader.advance((len - 3) as u64)
    }

    fn parse_cap(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()?;
        if len < 6 {
            return Err(DecodeError::InvalidContainer("CAP segment too short"));
        }
        self.header.pcap = Some(self.reader.read_u32()?);
        self.reader.advance((len - 6) as u64)
    }

    fn parse_rgn(&mut self) -> Result<(), DecodeError> {
        let len = self.reader.read_u16()? as u64;
        let wide_index = self.header.components.len() >= 257;
        let component_index = if wide_index {
            self.reader.read_u16()?
        } else {
            self.reader.read_u8()? as u16
        };
        let roi_style = self.reader.read_u8()?;
        let shift_value = self.reader.read_u8()?;

        let parsed = 2 + if wide_index { 2 } else { 1 } + 2;
        if len < parsed {
            return Err(DecodeError::InvalidContainer("RGN segment too short"));
        }
        self.reader.advance(len - parsed)?;
        self.header.roi = Some(RoiShift {
            component_index,
            roi_style,
            shift_value,
        });
        Ok(())
    }
}
