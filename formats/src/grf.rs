//! The GRF container: a RIFF file carrying a header block plus palette,
//! graphics, screen and block-index payloads. Every payload is prefixed
//! with a 4-byte compression header (`type | size << 8`) so a loader can
//! hand it straight to the hardware decompressor. Block data is aligned
//! to 4 bytes and the size recorded in each block header is rounded up
//! to match.

use std::path::Path;

use engine::bg::BgOutput;
use engine::texture::{Texture, TextureFormat};

use crate::compression::{CompressionPolicy, compress};
use crate::{Result, palette_bytes, write_file};

const GRF_VERSION: u16 = 2;

/// Graphics attribute codes recorded in the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxAttr {
    Bits2 = 0x02,
    Bits4 = 0x04,
    Bits8 = 0x08,
    Bits16 = 0x10,
    A5I3 = 0x80,
    A3I5 = 0x81,
    Tex4x4 = 0x82,
}

impl GfxAttr {
    const fn for_texture(format: TextureFormat) -> Self {
        match format {
            TextureFormat::Palette4 => Self::Bits2,
            TextureFormat::Palette16 => Self::Bits4,
            TextureFormat::Palette256 => Self::Bits8,
            TextureFormat::Direct => Self::Bits16,
            TextureFormat::A5I3 => Self::A5I3,
            TextureFormat::A3I5 => Self::A3I5,
            TextureFormat::Tex4x4 => Self::Tex4x4,
        }
    }

    const fn for_depth(depth: u32) -> Self {
        if depth == 4 { Self::Bits4 } else { Self::Bits8 }
    }
}

/// The `HDRX` block payload.
struct Header {
    gfx_attr: GfxAttr,
    scr_unit: u16,
    meta_unit: u16,
    palette_colors: u16,
    chr_width: u8,
    chr_height: u8,
    meta_width: u8,
    meta_height: u8,
    gfx_width: u32,
    gfx_height: u32,
}

impl Header {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.extend_from_slice(&GRF_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.gfx_attr as u16).to_le_bytes());
        out.extend_from_slice(&self.scr_unit.to_le_bytes());
        out.extend_from_slice(&self.meta_unit.to_le_bytes());
        out.extend_from_slice(&self.palette_colors.to_le_bytes());
        out.push(self.chr_width);
        out.push(self.chr_height);
        out.push(self.meta_width);
        out.push(self.meta_height);
        out.extend_from_slice(&self.gfx_width.to_le_bytes());
        out.extend_from_slice(&self.gfx_height.to_le_bytes());
        out
    }
}

/// Incrementally assembled RIFF body: `open` the writer, append blocks,
/// `finalize` to a byte vector with the outer header patched in.
struct Writer {
    body: Vec<u8>,
}

impl Writer {
    fn open() -> Self {
        Self {
            body: b"GRF ".to_vec(),
        }
    }

    fn block(&mut self, tag: &[u8; 4], payload: &[u8]) {
        // the header records the size rounded up to a multiple of 4,
        // and the data is padded to match
        let rounded = (payload.len() + 3) & !3;
        self.body.extend_from_slice(tag);
        self.body.extend_from_slice(&(rounded as u32).to_le_bytes());
        self.body.extend_from_slice(payload);
        self.body.resize(self.body.len() + (rounded - payload.len()), 0);
    }

    /// A data block: compression header followed by the encoded payload.
    fn data_block(&mut self, tag: &[u8; 4], data: &[u8], policy: CompressionPolicy) {
        let (kind, encoded) = compress(data, policy);
        let mut payload = Vec::with_capacity(4 + encoded.len());
        payload.extend_from_slice(&(u32::from(kind) | (encoded.len() as u32) << 8).to_le_bytes());
        payload.extend_from_slice(&encoded);
        self.block(tag, &payload);
    }

    fn finalize(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 8);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Write a background conversion as a GRF file.
///
/// # Errors
///
/// I/O failure while writing `path`.
pub fn write_bg(path: &Path, bg: &BgOutput, policy: CompressionPolicy) -> Result<()> {
    let mut writer = Writer::open();
    let header = Header {
        gfx_attr: GfxAttr::for_depth(bg.depth),
        scr_unit: bg.screen_unit_bits as u16,
        meta_unit: 0,
        palette_colors: bg.palette.len() as u16,
        chr_width: 8,
        chr_height: 8,
        meta_width: 0,
        meta_height: 0,
        gfx_width: bg.width as u32,
        gfx_height: bg.height as u32,
    };
    writer.block(b"HDRX", &header.to_bytes());
    writer.data_block(b"PAL ", &palette_bytes(&bg.palette), policy);
    writer.data_block(b"GFX ", &bg.chars, policy);
    if !bg.screen.is_empty() {
        writer.data_block(b"MAP ", &bg.screen, policy);
    }
    write_file(path, &writer.finalize())
}

/// Write a texture conversion as a GRF file.
///
/// # Errors
///
/// I/O failure while writing `path`.
pub fn write_texture(path: &Path, texture: &Texture, policy: CompressionPolicy) -> Result<()> {
    let format = texture.params.format();
    // the character unit of a texture is the 4x4 compression block, or a
    // single pixel for the uncompressed formats
    let tile_size = if format == TextureFormat::Tex4x4 { 4 } else { 1 };
    let mut writer = Writer::open();
    let header = Header {
        gfx_attr: GfxAttr::for_texture(format),
        scr_unit: 0,
        meta_unit: 0,
        palette_colors: texture.palette.len() as u16,
        chr_width: tile_size,
        chr_height: tile_size,
        meta_width: 0,
        meta_height: 0,
        gfx_width: texture.params.width() as u32,
        gfx_height: texture.params.height() as u32,
    };
    writer.block(b"HDRX", &header.to_bytes());
    if format.requires_palette() {
        writer.data_block(b"PAL ", &palette_bytes(&texture.palette), policy);
    }
    writer.data_block(b"GFX ", &texture.texel, policy);
    if format == TextureFormat::Tex4x4 {
        writer.data_block(b"PIDX", &texture.index, policy);
    }
    write_file(path, &writer.finalize())
}
