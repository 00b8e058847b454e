//! Background conversion: quantize, fit palettes per tile, dither, merge
//! characters and assemble palette/character/screen output.

use crate::bitfield::Bits;
use crate::color::{Bgr555, Rgba};
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::raster::Raster;
use crate::reduction::dither::dither_indices;
use crate::reduction::quantize::{create_multiple_palettes, create_palette};
use crate::reduction::{PaletteRegion, PaletteSet, Reduction};
use crate::tile::{TILE_DIM, TILE_PIXELS, Tile, assign_char_numbers, average_masters, merge_tiles};

/// Tiles per panel side in the hardware's text-screen addressing.
const PANEL_TILES: usize = 32;

/// Hardware background profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgProfile {
    /// Text BG, 4bpp, 16 palettes of 16 colors.
    Text16x16,
    /// Text BG, 8bpp, one 256-color palette.
    Text256x1,
    /// Affine BG, 8bpp, one palette, byte screen entries, no flipping.
    Affine256x1,
    /// Affine-extended BG, 8bpp, 16 palettes, halfword screen entries.
    AffineExt256x16,
    /// Bitmap BG: one 8bpp palette, pixel array, no characters.
    Bitmap,
}

impl BgProfile {
    #[must_use]
    pub const fn depth(self) -> u32 {
        match self {
            Self::Text16x16 => 4,
            _ => 8,
        }
    }

    #[must_use]
    pub const fn max_palettes(self) -> usize {
        match self {
            Self::Text16x16 | Self::AffineExt256x16 => 16,
            _ => 1,
        }
    }

    #[must_use]
    pub const fn max_chars(self) -> usize {
        match self {
            Self::Affine256x1 => 256,
            _ => 1024,
        }
    }

    #[must_use]
    pub const fn allows_flip(self) -> bool {
        matches!(
            self,
            Self::Text16x16 | Self::Text256x1 | Self::AffineExt256x16
        )
    }

    /// Byte-per-tile screen entries (affine) versus halfwords.
    #[must_use]
    pub const fn byte_screen(self) -> bool {
        matches!(self, Self::Affine256x1)
    }

    /// Only text-mode screens use the two-panel addressing that needs
    /// 32x32-tile swizzling.
    #[must_use]
    pub const fn swizzles(self) -> bool {
        matches!(self, Self::Text16x16 | Self::Text256x1)
    }

    #[must_use]
    pub const fn is_bitmap(self) -> bool {
        matches!(self, Self::Bitmap)
    }
}

/// Parameters for one background conversion.
#[derive(Debug, Clone)]
pub struct BgParams {
    pub profile: BgProfile,
    /// Palette region: `n_palettes` palettes starting at `palette_base`,
    /// each writing `palette_length` slots starting at `palette_offset`.
    pub n_palettes: usize,
    pub palette_base: usize,
    pub palette_offset: usize,
    pub palette_length: usize,
    /// Substitute this RGB for the reserved transparent slot, and treat
    /// matching opaque pixels as transparent.
    pub alpha_key: Option<Rgba>,
    pub dither: bool,
    pub diffuse: f64,
    /// Merge visually similar characters (the zero-cost and weighted
    /// passes of the tile engine).
    pub merge: bool,
    pub max_chars: usize,
    pub char_base: usize,
    pub flip: bool,
}

impl BgParams {
    #[must_use]
    pub const fn new(profile: BgProfile) -> Self {
        Self {
            profile,
            n_palettes: 1,
            palette_base: 0,
            palette_offset: 0,
            palette_length: 1 << profile.depth(),
            alpha_key: None,
            dither: false,
            diffuse: 1.0,
            merge: true,
            max_chars: profile.max_chars(),
            char_base: 0,
            flip: profile.allows_flip(),
        }
    }
}

/// Result of a background conversion, ready for a container writer.
/// For the bitmap profile `chars` holds the 8bpp pixel array and the
/// screen is empty.
#[derive(Debug, Clone)]
pub struct BgOutput {
    pub palette: Vec<Bgr555>,
    pub chars: Vec<u8>,
    pub screen: Vec<u8>,
    pub n_chars: usize,
    pub depth: u32,
    /// Bits per screen entry: 16, 8, or 0 for bitmap output.
    pub screen_unit_bits: u32,
    pub width: usize,
    pub height: usize,
}

fn validate(raster: &Raster, params: &BgParams) -> Result<()> {
    let profile = params.profile;
    let stride = 1usize << profile.depth();

    if params.palette_length == 0 {
        return Err(Error::InvalidConfig("empty palette region".into()));
    }
    if params.palette_offset + params.palette_length > stride {
        return Err(Error::InvalidConfig(format!(
            "palette offset {} + length {} exceeds {stride} colors",
            params.palette_offset, params.palette_length
        )));
    }
    if params.n_palettes == 0 || params.palette_base + params.n_palettes > profile.max_palettes() {
        return Err(Error::InvalidConfig(format!(
            "palette base {} + count {} exceeds the profile's {} palettes",
            params.palette_base,
            params.n_palettes,
            profile.max_palettes()
        )));
    }
    if params.flip && !profile.allows_flip() {
        return Err(Error::InvalidConfig(
            "tile flipping is not available on affine or bitmap profiles".into(),
        ));
    }

    if !profile.is_bitmap() {
        if raster.width() % TILE_DIM != 0 || raster.height() % TILE_DIM != 0 {
            return Err(Error::InvalidConfig(format!(
                "image {}x{} is not a multiple of {TILE_DIM} pixels",
                raster.width(),
                raster.height()
            )));
        }
        let n_tiles = raster.width() / TILE_DIM * (raster.height() / TILE_DIM);
        if !params.merge && n_tiles > profile.max_chars() {
            return Err(Error::InvalidConfig(format!(
                "{n_tiles} tiles exceed the profile's {} characters and merging is off",
                profile.max_chars()
            )));
        }
    }
    Ok(())
}

/// Force sub-midpoint alpha to fully transparent, everything else to
/// fully opaque; pixels matching the alpha key become transparent too.
fn normalize(pixels: &[Rgba], alpha_key: Option<Rgba>) -> Vec<Rgba> {
    pixels
        .iter()
        .map(|px| {
            if !px.is_opaque() {
                return Rgba::TRANSPARENT;
            }
            if let Some(key) = alpha_key {
                if px.rgb() == key.rgb() {
                    return Rgba::TRANSPARENT;
                }
            }
            px.with_alpha(0xFF)
        })
        .collect()
}

/// Convert a background image.
///
/// # Errors
///
/// [`Error::InvalidConfig`] for rejected parameter combinations and
/// [`Error::ImageTooLarge`] when the tile count would make the pair
/// matrices exceed the memory ceiling. No partial output in either case.
pub fn convert(
    rd: &Reduction,
    raster: &Raster,
    params: &BgParams,
    progress: &Progress,
) -> Result<BgOutput> {
    validate(raster, params)?;

    let profile = params.profile;
    let normalized = normalize(raster.pixels(), params.alpha_key);
    let region = PaletteRegion {
        base: params.palette_base,
        count: params.n_palettes,
        length: params.palette_length,
        offset: params.palette_offset,
    };

    if profile.is_bitmap() {
        return Ok(convert_bitmap(rd, raster, &normalized, params, region, progress));
    }

    let tiles_x = raster.width() / TILE_DIM;
    let tiles_y = raster.height() / TILE_DIM;
    let work = Raster::new(raster.width(), raster.height(), normalized);
    let tile_blocks: Vec<[Rgba; TILE_PIXELS]> = (0..tiles_x * tiles_y)
        .map(|n| work.block(TILE_DIM, n % tiles_x, n / tiles_x))
        .collect();

    // palette construction
    let mut set = PaletteSet::new(profile.depth(), region);
    if params.n_palettes == 1 {
        progress.phase1.set_max(1);
        let colors = create_palette(rd, work.pixels(), set.window_len(), true);
        set.set_window(params.palette_base, &colors);
        progress.phase1.finish();
    } else {
        create_multiple_palettes(rd, &tile_blocks, &mut set, &progress.phase1);
    }
    patch_transparent_slots(&mut set, params.alpha_key);

    // fit each tile to its best palette and index it
    let diffuse = if params.dither { params.diffuse } else { 0.0 };
    let mut tiles: Vec<Tile> = tile_blocks
        .iter()
        .enumerate()
        .map(|(n, block)| index_tile(rd, Tile::new(*block, n), &set, diffuse))
        .collect();

    if params.merge {
        let max_chars = params.max_chars.clamp(1, profile.max_chars());
        merge_tiles(rd, &mut tiles, max_chars, params.flip, &progress.phase2)?;
        average_masters(rd, &mut tiles, &set);
    } else {
        progress.phase2.set_max(1000);
        progress.phase2.finish();
    }

    let n_chars = assign_char_numbers(&mut tiles);
    let chars = pack_chars(&tiles, profile.depth(), n_chars);
    let screen = pack_screen(&tiles, tiles_x, tiles_y, params);

    Ok(BgOutput {
        palette: emit_palette(&set),
        chars,
        screen,
        n_chars,
        depth: profile.depth(),
        screen_unit_bits: if profile.byte_screen() { 8 } else { 16 },
        width: raster.width(),
        height: raster.height(),
    })
}

fn convert_bitmap(
    rd: &Reduction,
    raster: &Raster,
    normalized: &[Rgba],
    params: &BgParams,
    region: PaletteRegion,
    progress: &Progress,
) -> BgOutput {
    progress.phase1.set_max(1);
    let mut set = PaletteSet::new(params.profile.depth(), region);
    let colors = create_palette(rd, normalized, set.window_len(), true);
    set.set_window(params.palette_base, &colors);
    patch_transparent_slots(&mut set, params.alpha_key);
    progress.phase1.finish();

    let diffuse = if params.dither { params.diffuse } else { 0.0 };
    let window = set.window(params.palette_base);
    let slots = dither_indices(rd, normalized, raster.width(), window, diffuse);
    let pixels: Vec<u8> = slots
        .iter()
        .map(|slot| slot.map_or(0, |pos| set.slot_for(pos)))
        .collect();

    progress.phase2.set_max(1000);
    progress.phase2.finish();

    BgOutput {
        palette: emit_palette(&set),
        chars: pixels,
        screen: vec![],
        n_chars: 0,
        depth: params.profile.depth(),
        screen_unit_bits: 0,
        width: raster.width(),
        height: raster.height(),
    }
}

/// The reserved slot 0 of every palette in the region gets the alpha key
/// color when one is configured, otherwise it stays zero.
fn patch_transparent_slots(set: &mut PaletteSet, alpha_key: Option<Rgba>) {
    if !set.reserves_slot0() {
        return;
    }
    let Some(key) = alpha_key else { return };
    let region = *set.region();
    for p in region.base..region.base + region.count {
        set.set_slot(p, 0, key.with_alpha(0xFF));
    }
}

fn index_tile(rd: &Reduction, mut tile: Tile, set: &PaletteSet, diffuse: f64) -> Tile {
    let palette = set.best_palette(rd, &tile.yiq);
    let window = set.window(palette);
    let slots = dither_indices(rd, &tile.px, TILE_DIM, window, diffuse);

    let mut quantized = tile.px;
    for (n, slot) in slots.iter().enumerate() {
        match slot {
            Some(pos) => {
                tile.indices[n] = set.packed_index(palette, set.slot_for(*pos));
                quantized[n] = window[*pos].with_alpha(0xFF);
            }
            None => {
                tile.indices[n] = set.packed_index(palette, 0);
                quantized[n] = Rgba::TRANSPARENT;
            }
        }
    }
    tile.palette = palette;
    tile.set_pixels(quantized);
    tile
}

/// Pack master characters in numbering order: 4bpp low nibble first,
/// 8bpp one byte per pixel.
fn pack_chars(tiles: &[Tile], depth: u32, n_chars: usize) -> Vec<u8> {
    let bytes_per_char = TILE_PIXELS * depth as usize / 8;
    let mut chars = vec![0u8; n_chars * bytes_per_char];
    for (n, tile) in tiles.iter().enumerate() {
        if !tile.is_master(n) {
            continue;
        }
        let dest = &mut chars[tile.char_no * bytes_per_char..(tile.char_no + 1) * bytes_per_char];
        if depth == 8 {
            dest.copy_from_slice(&tile.indices);
        } else {
            for (d, pair) in dest.iter_mut().zip(tile.indices.chunks_exact(2)) {
                *d = (pair[0] & 0xF) | (pair[1] & 0xF) << 4;
            }
        }
    }
    chars
}

fn screen_entry(tile: &Tile, params: &BgParams) -> u16 {
    let mut char_no = tile.char_no + params.char_base;
    if char_no > 0x3FF {
        tracing::warn!(char_no, "character number exceeds the 10-bit field, clamping");
        char_no = 0x3FF;
    }
    0u16.with_bits(0..=9, char_no as u32)
        .with_bits(10..=11, u32::from(tile.flip.bits()))
        .with_bits(12..=15, tile.palette as u32)
}

fn pack_screen(tiles: &[Tile], tiles_x: usize, tiles_y: usize, params: &BgParams) -> Vec<u8> {
    let profile = params.profile;
    if profile.byte_screen() {
        return tiles
            .iter()
            .map(|tile| {
                let mut char_no = tile.char_no + params.char_base;
                if char_no > 0xFF {
                    tracing::warn!(char_no, "affine character number exceeds a byte, clamping");
                    char_no = 0xFF;
                }
                char_no as u8
            })
            .collect();
    }

    let mut out = Vec::with_capacity(tiles.len() * 2);
    let mut push = |tx: usize, ty: usize| {
        let entry = screen_entry(&tiles[tx + ty * tiles_x], params);
        out.extend_from_slice(&entry.to_le_bytes());
    };

    if profile.swizzles() {
        // 32x32-tile panels in row-major panel order, tiles row-major
        // inside each panel
        let panels_x = tiles_x.div_ceil(PANEL_TILES);
        let panels_y = tiles_y.div_ceil(PANEL_TILES);
        for py in 0..panels_y {
            for px in 0..panels_x {
                for ty in (py * PANEL_TILES)..((py + 1) * PANEL_TILES).min(tiles_y) {
                    for tx in (px * PANEL_TILES)..((px + 1) * PANEL_TILES).min(tiles_x) {
                        push(tx, ty);
                    }
                }
            }
        }
    } else {
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                push(tx, ty);
            }
        }
    }
    out
}

fn emit_palette(set: &PaletteSet) -> Vec<Bgr555> {
    set.emitted().iter().map(|&c| Bgr555::quantize(c)).collect()
}
