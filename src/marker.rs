//! JPEG 2000 marker codes (ISO/IEC 15444-1 Annex A) and JP2 box types (Annex I).

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum J2kMarker {
    /// SOC: Start of codestream.
    StartOfCodestream = 0xFF4F,
    /// CAP: Extended capabilities (Part 15 / HTJ2K).
    Capability = 0xFF50,
    /// SIZ: Image and tile size.
    ImageAndTileSize = 0xFF51,
    /// COD: Coding style default.
    CodingStyleDefault = 0xFF52,
    /// COC: Coding style component.
    CodingStyleComponent = 0xFF53,
    /// TLM: Tile-part lengths.
    TilePartLengths = 0xFF55,
    /// PLM: Packet lengths, main header.
    PacketLengthsMain = 0xFF57,
    /// PLT: Packet lengths, tile-part header.
    PacketLengthsTile = 0xFF58,
    /// QCD: Quantization default.
    QuantizationDefault = 0xFF5C,
    /// QCC: Quantization component.
    QuantizationComponent = 0xFF5D,
    /// RGN: Region of interest.
    RegionOfInterest = 0xFF5E,
    /// POC: Progression order change.
    ProgressionOrderChange = 0xFF5F,
    /// PPM: Packed packet headers, main header.
    PackedHeadersMain = 0xFF60,
    /// PPT: Packed packet headers, tile-part header.
    PackedHeadersTile = 0xFF61,
    /// CRG: Component registration.
    ComponentRegistration = 0xFF63,
    /// COM: Comment.
    Comment = 0xFF64,
    /// SOT: Start of tile-part; ends the main header.
    StartOfTile = 0xFF90,
    /// SOP: Start of packet.
    StartOfPacket = 0xFF91,
    /// EPH: End of packet header.
    EndOfPacketHeader = 0xFF92,
    /// SOD: Start of data.
    StartOfData = 0xFF93,
    /// EOC: End of codestream.
    EndOfCodestream = 0xFFD9,
}

impl J2kMarker {
    /// Markers that stand alone, without a length-prefixed segment.
    pub fn is_delimiting(self) -> bool {
        matches!(
            self,
            Self::StartOfCodestream
                | Self::StartOfData
                | Self::EndOfCodestream
                | Self::EndOfPacketHeader
        )
    }
}

/// JP2 box types, as the big-endian value of their four-character code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum BoxType {
    /// `jP  `: JPEG 2000 signature.
    Signature = 0x6A50_2020,
    /// `ftyp`: File type.
    FileType = 0x6674_7970,
    /// `jp2h`: JP2 header (superbox).
    Header = 0x6A70_3268,
    /// `ihdr`: Image header.
    ImageHeader = 0x6968_6472,
    /// `colr`: Colour specification.
    Colour = 0x636F_6C72,
    /// `bpcc`: Bits per component.
    BitsPerComponent = 0x6270_6363,
    /// `res `: Resolution (superbox).
    Resolution = 0x7265_7320,
    /// `jp2c`: Contiguous codestream.
    Codestream = 0x6A70_3263,
    /// `uuid`: Vendor extension.
    Uuid = 0x7575_6964,
    /// `xml `: XML metadata.
    Xml = 0x786D_6C20,
}

impl BoxType {
    /// Whether the box contains other boxes that must be descended into.
    pub fn is_superbox(self) -> bool {
        matches!(self, Self::Header | Self::Resolution)
    }
}

/// The complete 12-byte JP2 signature box.
pub const JP2_SIGNATURE: [u8; 12] = *b"\x00\x00\x00\x0CjP  \r\n\x87\n";

/// Enumerated colour spaces from the `colr` box (method 1).
pub const ENUMCS_SRGB: u32 = 16;
pub const ENUMCS_GREYSCALE: u32 = 17;
pub const ENUMCS_SYCC: u32 = 18;
