//! Texture conversion: format dispatch, parameter-word packing, the
//! paletted and translucent encoders, and the render-back decoder used
//! for verification.

pub mod tex4x4;

use crate::bitfield::Bits;
use crate::color::{Bgr555, Rgba};
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::raster::Raster;
use crate::reduction::dither::dither_indices;
use crate::reduction::quantize::create_palette;
use crate::reduction::Reduction;

/// Texture formats with their hardware tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    A3I5 = 1,
    Palette4 = 2,
    Palette16 = 3,
    Palette256 = 4,
    Tex4x4 = 5,
    A5I3 = 6,
    Direct = 7,
}

impl TextureFormat {
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::A3I5),
            2 => Some(Self::Palette4),
            3 => Some(Self::Palette16),
            4 => Some(Self::Palette256),
            5 => Some(Self::Tex4x4),
            6 => Some(Self::A5I3),
            7 => Some(Self::Direct),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::A3I5 => "a3i5",
            Self::Palette4 => "palette4",
            Self::Palette16 => "palette16",
            Self::Palette256 => "palette256",
            Self::Tex4x4 => "tex4x4",
            Self::A5I3 => "a5i3",
            Self::Direct => "direct",
        }
    }

    /// Texel bits per pixel (the 4x4 format averages 2, its index data
    /// is accounted separately).
    #[must_use]
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            Self::Palette4 | Self::Tex4x4 => 2,
            Self::Palette16 => 4,
            Self::A3I5 | Self::Palette256 | Self::A5I3 => 8,
            Self::Direct => 16,
        }
    }

    #[must_use]
    pub const fn requires_palette(self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// Hardware palette capacity for the paletted and translucent
    /// formats; unbounded (shared endpoint pool) for 4x4.
    #[must_use]
    pub const fn palette_capacity(self) -> usize {
        match self {
            Self::Palette4 => 4,
            Self::Palette16 => 16,
            Self::Palette256 => 256,
            Self::A3I5 => 32,
            Self::A5I3 => 8,
            Self::Tex4x4 => tex4x4::MAX_ENDPOINT_COLORS,
            Self::Direct => 0,
        }
    }
}

/// The packed 32-bit texture image parameter word:
/// `offset(16) | width_code(3) << 20 | height_code(3) << 23 |
/// format(3) << 26 | color0_transparent << 29`, sizes encoded as
/// `8 << code`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TextureParams(pub u32);

impl TextureParams {
    #[must_use]
    pub fn new(width: usize, height: usize, format: TextureFormat, color0: bool) -> Self {
        let wcode = (width / 8).trailing_zeros();
        let hcode = (height / 8).trailing_zeros();
        Self(
            0u32.with_bits(20..=22, wcode)
                .with_bits(23..=25, hcode)
                .with_bits(26..=28, format.tag())
                .with_bits(29..=29, u32::from(color0)),
        )
    }

    #[must_use]
    pub fn width(self) -> usize {
        8 << self.0.bits(20..=22)
    }

    #[must_use]
    pub fn height(self) -> usize {
        8 << self.0.bits(23..=25)
    }

    #[must_use]
    pub fn format(self) -> TextureFormat {
        TextureFormat::from_tag(self.0.bits(26..=28)).unwrap_or(TextureFormat::Direct)
    }

    #[must_use]
    pub fn color0_transparent(self) -> bool {
        self.0.bit(29)
    }
}

/// A texture dimension must be a power of two in `[8, 1024]`.
#[must_use]
pub const fn dimension_is_valid(x: usize) -> bool {
    x.is_power_of_two() && x >= 8 && x <= 1024
}

/// Round up to the next valid texture dimension.
#[must_use]
pub const fn round_dimension(x: usize) -> usize {
    if x <= 8 {
        8
    } else {
        x.next_power_of_two()
    }
}

/// A converted texture: the parameter word, texel data, the 4x4 block
/// index data (empty for every other format) and the palette.
#[derive(Debug, Clone)]
pub struct Texture {
    pub params: TextureParams,
    pub texel: Vec<u8>,
    pub index: Vec<u8>,
    pub palette: Vec<Bgr555>,
}

impl Texture {
    /// Texel bytes the full-size texture occupies in VRAM (the stored
    /// buffer may be shorter when trailing rows were trimmed).
    #[must_use]
    pub fn texel_vram_size(&self) -> usize {
        self.params.width() * self.params.height() * self.params.format().bits_per_pixel() / 8
    }

    /// Block index bytes in VRAM; half the texel size for 4x4, zero
    /// otherwise.
    #[must_use]
    pub fn index_vram_size(&self) -> usize {
        if self.params.format() == TextureFormat::Tex4x4 {
            self.texel_vram_size() / 2
        } else {
            0
        }
    }

    #[must_use]
    pub fn palette_vram_size(&self) -> usize {
        self.palette.len() * 2
    }
}

/// Parameters for one texture conversion.
#[derive(Debug, Clone)]
pub struct ConvertParams {
    pub format: TextureFormat,
    pub dither: bool,
    pub diffuse: f64,
    /// Diffuse the quantized alpha field of the translucent formats.
    pub dither_alpha: bool,
    /// Cap on palette colors; 0 means the format's capacity.
    pub color_entries: usize,
    pub color0_transparent: bool,
    /// 4x4 endpoint-palette compression strength, 0..=100.
    pub threshold: u32,
    /// Drop texel rows past the source height (the parameter word keeps
    /// the padded size).
    pub trim: bool,
}

impl ConvertParams {
    #[must_use]
    pub const fn new(format: TextureFormat) -> Self {
        Self {
            format,
            dither: false,
            diffuse: 1.0,
            dither_alpha: false,
            color_entries: 0,
            color0_transparent: false,
            threshold: 0,
            trim: false,
        }
    }
}

/// Convert an image to a texture.
///
/// The output dimensions are the source dimensions rounded up to powers
/// of two in `[8, 1024]`; padding pixels are fully transparent and never
/// reach the palette.
///
/// # Errors
///
/// [`Error::InvalidConfig`] when the source exceeds 1024 pixels on an
/// axis or the color cap exceeds the format's capacity.
pub fn convert(
    rd: &Reduction,
    raster: &Raster,
    params: &ConvertParams,
    progress: &Progress,
) -> Result<Texture> {
    if raster.width() == 0 || raster.height() == 0 {
        return Err(Error::InvalidConfig("empty image".into()));
    }
    if raster.width() > 1024 || raster.height() > 1024 {
        return Err(Error::InvalidConfig(format!(
            "image {}x{} exceeds the 1024 pixel texture limit",
            raster.width(),
            raster.height()
        )));
    }
    let capacity = params.format.palette_capacity();
    if params.format.requires_palette() && params.color_entries > capacity {
        return Err(Error::InvalidConfig(format!(
            "{} colors exceed the {} format's {capacity}",
            params.color_entries,
            params.format.name()
        )));
    }
    if params.color0_transparent && params.color_entries == 1 {
        return Err(Error::InvalidConfig(
            "a reserved transparent slot leaves no room for colors".into(),
        ));
    }

    let width = round_dimension(raster.width());
    let height = round_dimension(raster.height());
    let padded = raster.padded(width, height);

    let mut texture = match params.format {
        TextureFormat::Direct => convert_direct(&padded, progress),
        TextureFormat::Tex4x4 => {
            let (texel, index, palette) =
                tex4x4::convert(rd, &padded, params.threshold, progress);
            Texture {
                params: TextureParams::new(width, height, TextureFormat::Tex4x4, false),
                texel,
                index,
                palette,
            }
        }
        TextureFormat::A3I5 | TextureFormat::A5I3 => convert_translucent(rd, &padded, params, progress),
        _ => convert_paletted(rd, &padded, params, progress),
    };

    if params.trim {
        trim_rows(&mut texture, raster.height());
    }
    Ok(texture)
}

fn convert_direct(padded: &Raster, progress: &Progress) -> Texture {
    progress.phase1.set_max(1);
    let mut texel = Vec::with_capacity(padded.pixels().len() * 2);
    for px in padded.pixels() {
        let color = Bgr555::quantize(*px).with_opaque_flag(px.is_opaque());
        texel.extend_from_slice(&color.0.to_le_bytes());
    }
    progress.phase1.finish();
    progress.phase2.finish();

    Texture {
        params: TextureParams::new(padded.width(), padded.height(), TextureFormat::Direct, false),
        texel,
        index: vec![],
        palette: vec![],
    }
}

fn convert_paletted(
    rd: &Reduction,
    padded: &Raster,
    params: &ConvertParams,
    progress: &Progress,
) -> Texture {
    progress.phase1.set_max(1);
    let capacity = params.format.palette_capacity();
    let entries = if params.color_entries == 0 {
        capacity
    } else {
        params.color_entries
    };
    let reserve = usize::from(params.color0_transparent);

    // without a transparent slot every pixel must land on a color
    let work: Vec<Rgba> = if params.color0_transparent {
        padded.pixels().to_vec()
    } else {
        padded.pixels().iter().map(|px| px.with_alpha(0xFF)).collect()
    };

    let window = create_palette(rd, &work, entries - reserve, true);
    let diffuse = if params.dither { params.diffuse } else { 0.0 };
    let slots = dither_indices(rd, &work, padded.width(), &window, diffuse);
    let indices: Vec<u8> = slots
        .iter()
        .map(|slot| slot.map_or(0, |pos| (pos + reserve) as u8))
        .collect();

    let mut palette = Vec::with_capacity(entries);
    if params.color0_transparent {
        palette.push(Bgr555(0));
    }
    palette.extend(window.iter().map(|&c| Bgr555::quantize(c)));

    progress.phase1.finish();
    progress.phase2.finish();

    Texture {
        params: TextureParams::new(
            padded.width(),
            padded.height(),
            params.format,
            params.color0_transparent,
        ),
        texel: pack_indices(&indices, params.format.bits_per_pixel()),
        index: vec![],
        palette,
    }
}

fn convert_translucent(
    rd: &Reduction,
    padded: &Raster,
    params: &ConvertParams,
    progress: &Progress,
) -> Texture {
    progress.phase1.set_max(1);
    let (index_bits, alpha_bits) = match params.format {
        TextureFormat::A3I5 => (5u32, 3u32),
        _ => (3, 5),
    };
    let capacity = params.format.palette_capacity();
    let entries = if params.color_entries == 0 {
        capacity
    } else {
        params.color_entries
    };

    // color selection ignores translucency; alpha travels in its own field
    let opaque: Vec<Rgba> = padded.pixels().iter().map(|px| px.with_alpha(0xFF)).collect();
    let window = create_palette(rd, &opaque, entries, true);
    let diffuse = if params.dither { params.diffuse } else { 0.0 };
    let slots = dither_indices(rd, &opaque, padded.width(), &window, diffuse);

    let alphas: Vec<u8> = padded.pixels().iter().map(|px| px.a()).collect();
    let levels = quantize_alpha_plane(&alphas, padded.width(), 1 << alpha_bits, params.dither_alpha);

    let texel: Vec<u8> = slots
        .iter()
        .zip(&levels)
        .map(|(slot, &level)| {
            let index = slot.unwrap_or(0) as u8;
            index | level << index_bits
        })
        .collect();

    progress.phase1.finish();
    progress.phase2.finish();

    Texture {
        params: TextureParams::new(padded.width(), padded.height(), params.format, false),
        texel,
        index: vec![],
        palette: window.iter().map(|&c| Bgr555::quantize(c)).collect(),
    }
}

/// Quantize an alpha plane to `levels` steps, optionally diffusing the
/// quantization error with the Floyd-Steinberg kernel.
fn quantize_alpha_plane(alphas: &[u8], width: usize, levels: u32, diffuse: bool) -> Vec<u8> {
    let steps = f64::from(levels - 1);
    let height = if width == 0 { 0 } else { alphas.len() / width };
    let mut residual = vec![0.0f64; alphas.len()];
    let mut out = vec![0u8; alphas.len()];

    for y in 0..height {
        for x in 0..width {
            let n = x + y * width;
            let value = (f64::from(alphas[n]) + residual[n]).clamp(0.0, 255.0);
            let level = (value * steps / 255.0).round();
            out[n] = level as u8;

            if diffuse {
                let reconstructed = level * 255.0 / steps;
                let err = value - reconstructed;
                let mut spread = |dx: isize, dy: isize, share: f64| {
                    let tx = x as isize + dx;
                    let ty = y as isize + dy;
                    if tx >= 0 && (tx as usize) < width && (ty as usize) < height {
                        residual[tx as usize + ty as usize * width] += err * share;
                    }
                };
                spread(1, 0, 7.0 / 16.0);
                spread(-1, 1, 3.0 / 16.0);
                spread(0, 1, 5.0 / 16.0);
                spread(1, 1, 1.0 / 16.0);
            }
        }
    }
    out
}

/// Pack one index per pixel into the texel layout: 2bpp and 4bpp fill
/// each byte from the low bits up.
fn pack_indices(indices: &[u8], bits_per_pixel: usize) -> Vec<u8> {
    match bits_per_pixel {
        2 => indices
            .chunks_exact(4)
            .map(|c| c[0] & 3 | (c[1] & 3) << 2 | (c[2] & 3) << 4 | (c[3] & 3) << 6)
            .collect(),
        4 => indices
            .chunks_exact(2)
            .map(|c| c[0] & 0xF | (c[1] & 0xF) << 4)
            .collect(),
        _ => indices.to_vec(),
    }
}

fn trim_rows(texture: &mut Texture, source_height: usize) {
    let format = texture.params.format();
    let width = texture.params.width();
    if format == TextureFormat::Tex4x4 {
        let block_rows = source_height.div_ceil(4);
        texture.texel.truncate(block_rows * (width / 4) * 4);
        texture.index.truncate(block_rows * (width / 4) * 2);
    } else {
        let row_bytes = width * format.bits_per_pixel() / 8;
        texture.texel.truncate(source_height * row_bytes);
    }
}

/// Decode a texture back to RGBA, the inverse of [`convert`]. Used for
/// previews and by the round-trip tests.
#[must_use]
pub fn render(texture: &Texture) -> Raster {
    let width = texture.params.width();
    let height = texture.params.height();
    let format = texture.params.format();
    let c0xp = texture.params.color0_transparent();
    let mut out = Raster::filled(width, height, Rgba::TRANSPARENT);

    let pal = |n: usize| -> Rgba {
        texture
            .palette
            .get(n)
            .map_or(Rgba::TRANSPARENT, |c| c.expand())
    };

    match format {
        TextureFormat::Direct => {
            for (n, bytes) in texture.texel.chunks_exact(2).enumerate() {
                let color = Bgr555(u16::from_le_bytes([bytes[0], bytes[1]]));
                out.pixels_mut()[n] = color.expand_with_flag();
            }
        }
        TextureFormat::Palette4 | TextureFormat::Palette16 | TextureFormat::Palette256 => {
            let bpp = format.bits_per_pixel();
            let per_byte = 8 / bpp;
            let mask = (1usize << bpp) - 1;
            for (byte_n, &byte) in texture.texel.iter().enumerate() {
                for k in 0..per_byte {
                    let n = byte_n * per_byte + k;
                    if n >= width * height {
                        break;
                    }
                    let slot = usize::from(byte) >> (k * bpp) & mask;
                    out.pixels_mut()[n] = if slot == 0 && c0xp {
                        Rgba::TRANSPARENT
                    } else {
                        pal(slot)
                    };
                }
            }
        }
        TextureFormat::A3I5 | TextureFormat::A5I3 => {
            let (index_bits, alpha_bits) = if format == TextureFormat::A3I5 {
                (5u32, 3u32)
            } else {
                (3, 5)
            };
            let steps = (1u32 << alpha_bits) - 1;
            for (n, &byte) in texture.texel.iter().enumerate() {
                let index = usize::from(byte) & ((1 << index_bits) - 1);
                let level = u32::from(byte) >> index_bits;
                let alpha = (level * 255 / steps) as u8;
                out.pixels_mut()[n] = pal(index).with_alpha(alpha);
            }
        }
        TextureFormat::Tex4x4 => {
            tex4x4::render_blocks(texture, &mut out);
        }
    }
    out
}
