//! The 4x4 block compressor: per-block endpoint/mode selection and the
//! shared endpoint-palette construction with its optional compression
//! pass.

use std::collections::HashMap;

use crate::color::{Bgr555, Rgba, Yiq};
use crate::progress::Progress;
use crate::raster::Raster;
use crate::reduction::Reduction;
use crate::reduction::quantize::create_palette;

/// Block index entry mode bits.
pub const MODE_INTERPOLATE: u16 = 0x4000;
pub const MODE_OPAQUE: u16 = 0x8000;
pub const MODE_MASK: u16 = 0xC000;
pub const INDEX_MASK: u16 = 0x3FFF;

/// The 14-bit halfword address bounds the endpoint palette.
pub const MAX_ENDPOINT_COLORS: usize = 1 << 14;

/// Candidate window for the palette compression sweep; runs are compared
/// against their luma-sorted neighbors instead of all pairs.
const MERGE_WINDOW: usize = 32;

const BLOCK_DIM: usize = 4;
const BLOCK_PIXELS: usize = 16;

/// Endpoint colors a block's mode actually addresses.
const fn endpoints_needed(mode: u16) -> usize {
    match mode & MODE_MASK {
        m if m == MODE_OPAQUE => 4,
        m if m == (MODE_OPAQUE | MODE_INTERPOLATE) => 2,
        m if m == MODE_INTERPOLATE => 2, // transparent + interpolated
        _ => 3,                          // transparent + full
    }
}

/// Blend two hardware colors in 8-bit space with rounding, then snap the
/// result back to 5 bits per channel. `factor` is in eighths.
fn blend(a: Bgr555, b: Bgr555, factor: u32) -> Bgr555 {
    let ea = a.expand();
    let eb = b.expand();
    let mix = |x: u8, y: u8| -> u8 {
        ((u32::from(x) * (8 - factor) + u32::from(y) * factor + 4) / 8) as u8
    };
    Bgr555::quantize(Rgba::new(
        mix(ea.r(), eb.r()),
        mix(ea.g(), eb.g()),
        mix(ea.b(), eb.b()),
        0xFF,
    ))
}

/// The four reconstruction colors a block sees for a mode and endpoint
/// run; `None` is the transparent sentinel.
fn derive_table(mode: u16, run: &[Bgr555]) -> [Option<Rgba>; 4] {
    let color = |n: usize| run.get(n).copied().unwrap_or_default();
    match mode & MODE_MASK {
        m if m == MODE_OPAQUE => [
            Some(color(0).expand()),
            Some(color(1).expand()),
            Some(color(2).expand()),
            Some(color(3).expand()),
        ],
        m if m == (MODE_OPAQUE | MODE_INTERPOLATE) => [
            Some(color(0).expand()),
            Some(color(1).expand()),
            Some(blend(color(0), color(1), 3).expand()),
            Some(blend(color(0), color(1), 5).expand()),
        ],
        m if m == MODE_INTERPOLATE => [
            Some(color(0).expand()),
            Some(color(1).expand()),
            Some(blend(color(0), color(1), 4).expand()),
            None,
        ],
        _ => [
            Some(color(0).expand()),
            Some(color(1).expand()),
            Some(color(2).expand()),
            None,
        ],
    }
}

/// Pick the best reconstruction index for every pixel; returns the
/// packed 32-bit texel word and the accumulated error.
fn assign_block(rd: &Reduction, pixels: &[Yiq; BLOCK_PIXELS], table: &[Option<Rgba>; 4]) -> (u32, f64) {
    let table_yiq: Vec<Yiq> = table
        .iter()
        .map(|entry| entry.map_or(
            Yiq {
                y: 0,
                i: 0.0,
                q: 0.0,
                a: 0.0,
            },
            Yiq::from,
        ))
        .collect();

    let mut word = 0u32;
    let mut total = 0.0;
    for (n, px) in pixels.iter().enumerate() {
        let mut best = 0;
        let mut best_diff = f64::INFINITY;
        for (k, entry) in table_yiq.iter().enumerate() {
            let d = rd.diff(px, entry);
            if d < best_diff {
                best_diff = d;
                best = k;
            }
        }
        word |= (best as u32) << (n * 2);
        total += best_diff;
    }
    (word, total)
}

/// A shared run of endpoint colors plus the blocks referencing it.
/// Interpolated modes address 2 colors, full modes 4 (the transparent
/// full mode uses 3 and leaves the fourth as padding).
struct Run {
    colors: Vec<Bgr555>,
    blocks: Vec<usize>,
    alive: bool,
}

struct Block {
    yiq: [Yiq; BLOCK_PIXELS],
    mode: u16,
    run: usize,
    error: f64,
}

/// Quantize the block to `n` endpoint colors, hardware-rounded.
fn block_endpoints(rd: &Reduction, pixels: &[Rgba], n: usize) -> Vec<Bgr555> {
    create_palette(rd, pixels, n, true)
        .into_iter()
        .map(Bgr555::quantize)
        .collect()
}

/// Compress a power-of-two RGBA image (dimensions multiples of 4) into
/// texel words, block index entries and the shared endpoint palette.
pub fn convert(
    rd: &Reduction,
    padded: &Raster,
    threshold: u32,
    progress: &Progress,
) -> (Vec<u8>, Vec<u8>, Vec<Bgr555>) {
    let blocks_x = padded.width() / BLOCK_DIM;
    let blocks_y = padded.height() / BLOCK_DIM;
    let n_blocks = blocks_x * blocks_y;
    progress.phase1.set_max(n_blocks as u32);

    let mut runs: Vec<Run> = Vec::new();
    let mut run_ids: HashMap<Vec<u16>, usize> = HashMap::new();
    let mut blocks: Vec<Block> = Vec::with_capacity(n_blocks);

    for n in 0..n_blocks {
        let raw: [Rgba; BLOCK_PIXELS] = padded.block(BLOCK_DIM, n % blocks_x, n / blocks_x);
        let normalized: Vec<Rgba> = raw
            .iter()
            .map(|px| {
                if px.is_opaque() {
                    px.with_alpha(0xFF)
                } else {
                    Rgba::TRANSPARENT
                }
            })
            .collect();
        let mut yiq = [Yiq::default(); BLOCK_PIXELS];
        for (slot, px) in yiq.iter_mut().zip(&normalized) {
            *slot = Yiq::from(*px);
        }

        // evaluate all four modes; the alpha term of the metric rules
        // out the transparency-incorrect ones on its own
        let full4 = block_endpoints(rd, &normalized, 4);
        let full3 = block_endpoints(rd, &normalized, 3);
        let pair = block_endpoints(rd, &normalized, 2);

        let candidates = [
            (MODE_OPAQUE, pad_run(&full4, 4)),
            (MODE_OPAQUE | MODE_INTERPOLATE, pair.clone()),
            (0, pad_run(&full3, 4)),
            (MODE_INTERPOLATE, pair),
        ];

        let mut best: Option<(u16, Vec<Bgr555>, f64)> = None;
        for (mode, run) in candidates {
            let table = derive_table(mode, &run);
            let (_, err) = assign_block(rd, &yiq, &table);
            if best.as_ref().is_none_or(|(_, _, b)| err < *b) {
                best = Some((mode, run, err));
            }
        }
        let (mode, colors, error) = best.expect("four candidate modes");

        let run = *run_ids.entry(colors_key(&colors)).or_insert_with(|| {
            runs.push(Run {
                colors: colors.clone(),
                blocks: vec![],
                alive: true,
            });
            runs.len() - 1
        });
        runs[run].blocks.push(n);
        blocks.push(Block {
            yiq,
            mode,
            run,
            error,
        });
        progress.phase1.add(1);
    }

    compress_palette(rd, &mut runs, &mut blocks, threshold, progress);
    emit(rd, &runs, &blocks, blocks_x, blocks_y)
}

fn colors_key(colors: &[Bgr555]) -> Vec<u16> {
    colors.iter().map(|c| c.0).collect()
}

/// Full modes address up to four colors; keep every run an even number
/// of halfwords so pair addressing stays valid.
fn pad_run(colors: &[Bgr555], len: usize) -> Vec<Bgr555> {
    let mut out = colors.to_vec();
    out.resize(len, Bgr555(0));
    out
}

fn palette_len(runs: &[Run]) -> usize {
    runs.iter().filter(|r| r.alive).map(|r| r.colors.len()).sum()
}

/// Iteratively merge the two endpoint runs whose combined centroid
/// raises total reconstruction error the least, while the increase stays
/// under the threshold-scaled tolerance. While the palette overflows the
/// 14-bit address space the cheapest merge is taken regardless of the
/// tolerance; overflow is never an error.
fn compress_palette(
    rd: &Reduction,
    runs: &mut Vec<Run>,
    blocks: &mut [Block],
    threshold: u32,
    progress: &Progress,
) {
    progress.phase2.set_max(runs.len() as u32 + 1);

    let mean_error = if blocks.is_empty() {
        0.0
    } else {
        blocks.iter().map(|b| b.error).sum::<f64>() / blocks.len() as f64
    };
    // per-affected-block budget; the scale is heuristic, the contract is
    // only "higher threshold = smaller palette, lower fidelity"
    let strength = f64::from(threshold) / 100.0;
    let tolerance = strength * strength * (4.0 * mean_error + 2e6);

    loop {
        let over = palette_len(runs) > MAX_ENDPOINT_COLORS;
        if !over && tolerance <= 0.0 {
            break;
        }

        // while the palette overflows the index field, the cheapest
        // merge is taken unconditionally: overflow is never an error
        match best_merge(rd, runs, blocks) {
            Some(candidate) => {
                let affected = (runs[candidate.a].blocks.len()
                    + runs[candidate.b].blocks.len()) as f64;
                if over || candidate.delta <= tolerance * affected {
                    apply_merge(rd, runs, blocks, candidate);
                    progress.phase2.add(1);
                } else {
                    break;
                }
            }
            None => break,
        }
    }
    progress.phase2.finish();
}

struct MergeCandidate {
    a: usize,
    b: usize,
    colors: Vec<Bgr555>,
    delta: f64,
}

/// Scan luma-sorted neighbor runs of equal length for the cheapest merge.
fn best_merge(rd: &Reduction, runs: &[Run], blocks: &[Block]) -> Option<MergeCandidate> {
    let mut order: Vec<usize> = (0..runs.len()).filter(|&n| runs[n].alive).collect();
    if order.len() < 2 {
        return None;
    }
    order.sort_by_key(|&n| {
        let c = runs[n].colors[0];
        (runs[n].colors.len(), Yiq::from(c.expand()).y)
    });

    let mut best: Option<MergeCandidate> = None;
    for (pos, &a) in order.iter().enumerate() {
        for &b in order.iter().skip(pos + 1).take(MERGE_WINDOW) {
            if runs[a].colors.len() != runs[b].colors.len() {
                break; // sorted by length first; no more equal-length partners
            }
            let colors = merged_colors(&runs[a], &runs[b]);
            let mut delta = 0.0;
            for &n in runs[a].blocks.iter().chain(&runs[b].blocks) {
                let block = &blocks[n];
                let table = derive_table(block.mode, &colors);
                let (_, err) = assign_block(rd, &block.yiq, &table);
                delta += err - block.error;
            }
            if best.as_ref().is_none_or(|c| delta < c.delta) {
                best = Some(MergeCandidate {
                    a,
                    b,
                    colors,
                    delta,
                });
            }
        }
    }
    best
}

/// Reference-count weighted average of two runs, position by position.
fn merged_colors(a: &Run, b: &Run) -> Vec<Bgr555> {
    let wa = a.blocks.len() as u32;
    let wb = b.blocks.len() as u32;
    let total = wa + wb;
    a.colors
        .iter()
        .zip(&b.colors)
        .map(|(&ca, &cb)| {
            let ea = ca.expand();
            let eb = cb.expand();
            let mix = |x: u8, y: u8| {
                ((u32::from(x) * wa + u32::from(y) * wb + total / 2) / total) as u8
            };
            Bgr555::quantize(Rgba::new(
                mix(ea.r(), eb.r()),
                mix(ea.g(), eb.g()),
                mix(ea.b(), eb.b()),
                0xFF,
            ))
        })
        .collect()
}

fn apply_merge(rd: &Reduction, runs: &mut [Run], blocks: &mut [Block], candidate: MergeCandidate) {
    let MergeCandidate { a, b, colors, .. } = candidate;
    let moved = std::mem::take(&mut runs[b].blocks);
    runs[b].alive = false;
    for &n in &moved {
        blocks[n].run = a;
    }
    runs[a].blocks.extend(moved);
    runs[a].colors = colors;

    // refresh cached errors against the merged endpoints
    let run_blocks = runs[a].blocks.clone();
    for n in run_blocks {
        let table = derive_table(blocks[n].mode, &runs[a].colors);
        let (_, err) = assign_block(rd, &blocks[n].yiq, &table);
        blocks[n].error = err;
    }
}

/// Lay out the surviving runs, re-assign every block's texel word
/// against its final endpoints and emit the three buffers.
fn emit(
    rd: &Reduction,
    runs: &[Run],
    blocks: &[Block],
    blocks_x: usize,
    blocks_y: usize,
) -> (Vec<u8>, Vec<u8>, Vec<Bgr555>) {
    let mut offsets = vec![0usize; runs.len()];
    let mut palette: Vec<Bgr555> = Vec::new();
    for (n, run) in runs.iter().enumerate() {
        if !run.alive {
            continue;
        }
        offsets[n] = palette.len();
        palette.extend_from_slice(&run.colors);
    }

    let n_blocks = blocks_x * blocks_y;
    let mut texel = Vec::with_capacity(n_blocks * 4);
    let mut index = Vec::with_capacity(n_blocks * 2);
    for block in blocks {
        let run = &runs[block.run];
        let table = derive_table(block.mode, &run.colors);
        let (word, _) = assign_block(rd, &block.yiq, &table);
        texel.extend_from_slice(&word.to_le_bytes());

        let address = (offsets[block.run] / 2) as u16;
        let entry = address & INDEX_MASK | block.mode;
        index.extend_from_slice(&entry.to_le_bytes());
    }
    (texel, index, palette)
}

/// Decode every 4x4 block of `texture` into `out`; the render-back half
/// of the compressor.
pub(crate) fn render_blocks(texture: &crate::texture::Texture, out: &mut Raster) {
    let width = texture.params.width();
    let blocks_x = width / BLOCK_DIM;
    let n_blocks = texture.texel.len() / 4;

    for n in 0..n_blocks {
        let word = u32::from_le_bytes([
            texture.texel[n * 4],
            texture.texel[n * 4 + 1],
            texture.texel[n * 4 + 2],
            texture.texel[n * 4 + 3],
        ]);
        let entry = u16::from_le_bytes([texture.index[n * 2], texture.index[n * 2 + 1]]);
        let address = usize::from(entry & INDEX_MASK) * 2;
        let mode = entry & MODE_MASK;

        let run_len = endpoints_needed(mode).max(2);
        let run: Vec<Bgr555> = (address..address + run_len)
            .map(|k| texture.palette.get(k).copied().unwrap_or_default())
            .collect();
        let table = derive_table(mode, &run);

        for p in 0..BLOCK_PIXELS {
            let k = (word >> (p * 2) & 3) as usize;
            let color = table[k].unwrap_or(Rgba::TRANSPARENT);
            let x = (n % blocks_x) * BLOCK_DIM + p % BLOCK_DIM;
            let y = (n / blocks_x) * BLOCK_DIM + p / BLOCK_DIM;
            out[(x, y)] = color;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::snap_to_hardware;
    use crate::progress::Progress;
    use crate::texture::{ConvertParams, TextureFormat, convert as convert_texture, render};
    use pretty_assertions::assert_eq;

    fn distinct_16_colors() -> Raster {
        let mut raster = Raster::filled(8, 8, Rgba::TRANSPARENT);
        for by in 0..2 {
            for bx in 0..2 {
                for p in 0..16 {
                    let shade = (p / 4 * 80) as u8;
                    let color = match (bx, by) {
                        (0, 0) => Rgba::new(255, shade, shade, 255),
                        (1, 0) => Rgba::new(shade, 255, shade, 255),
                        (0, 1) => Rgba::new(shade, shade, 255, 255),
                        _ => Rgba::new(shade, shade, shade, 255),
                    };
                    raster[(bx * 4 + p % 4, by * 4 + p / 4)] = color;
                }
            }
        }
        raster
    }

    fn psnr(a: &Raster, b: &Raster) -> f64 {
        let mut se = 0.0;
        let mut n = 0.0;
        for (pa, pb) in a.pixels().iter().zip(b.pixels()) {
            for (ca, cb) in [
                (pa.r(), pb.r()),
                (pa.g(), pb.g()),
                (pa.b(), pb.b()),
            ] {
                let d = f64::from(ca) - f64::from(cb);
                se += d * d;
                n += 1.0;
            }
        }
        if se == 0.0 {
            return f64::INFINITY;
        }
        10.0 * (255.0f64 * 255.0 * n / se).log10()
    }

    #[test]
    fn blend_matches_hardware_rounding() {
        let black = Bgr555::from_rgb(0, 0, 0);
        let white = Bgr555::from_rgb(31, 31, 31);
        assert_eq!(blend(black, white, 4), Bgr555::from_rgb(16, 16, 16));
        assert_eq!(blend(black, white, 0), black);
        assert_eq!(blend(black, white, 8), white);
    }

    #[test]
    fn endpoints_per_mode() {
        assert_eq!(endpoints_needed(MODE_OPAQUE), 4);
        assert_eq!(endpoints_needed(MODE_OPAQUE | MODE_INTERPOLATE), 2);
        assert_eq!(endpoints_needed(0), 3);
        assert_eq!(endpoints_needed(MODE_INTERPOLATE), 2);
    }

    #[test]
    fn opaque_blocks_use_opaque_modes_and_small_palette() {
        let rd = Reduction::default();
        let raster = distinct_16_colors();
        let params = ConvertParams::new(TextureFormat::Tex4x4);
        let tex = convert_texture(&rd, &raster, &params, &Progress::default()).unwrap();

        // four blocks: 32-bit texel + 16-bit index each
        assert_eq!(tex.texel.len(), 16);
        assert_eq!(tex.index.len(), 8);
        assert!(tex.palette.len() <= 16);

        for n in 0..4 {
            let entry = u16::from_le_bytes([tex.index[n * 2], tex.index[n * 2 + 1]]);
            assert_ne!(entry & MODE_OPAQUE, 0, "block {n} must be opaque");
        }

        let rendered = render(&tex);
        assert!(psnr(&raster, &rendered) > 30.0);
    }

    #[test]
    fn index_entries_stay_inside_the_palette() {
        let rd = Reduction::default();
        let mut raster = Raster::filled(16, 16, Rgba::TRANSPARENT);
        for y in 0..16 {
            for x in 0..16 {
                let a = if (x + y) % 5 == 0 { 0 } else { 255 };
                raster[(x, y)] = Rgba::new((x * 16) as u8, (y * 16) as u8, 128, a);
            }
        }
        let params = ConvertParams::new(TextureFormat::Tex4x4);
        let tex = convert_texture(&rd, &raster, &params, &Progress::default()).unwrap();

        for pair in tex.index.chunks_exact(2) {
            let entry = u16::from_le_bytes([pair[0], pair[1]]);
            let address = usize::from(entry & INDEX_MASK) * 2;
            let needed = endpoints_needed(entry & MODE_MASK);
            assert!(address + needed <= tex.palette.len());
        }
    }

    #[test]
    fn transparent_pixels_round_trip() {
        let rd = Reduction::default();
        let mut raster = Raster::filled(8, 8, Rgba::new(200, 40, 40, 255));
        for x in 0..8 {
            raster[(x, 0)] = Rgba::TRANSPARENT;
        }
        let params = ConvertParams::new(TextureFormat::Tex4x4);
        let tex = convert_texture(&rd, &raster, &params, &Progress::default()).unwrap();
        let rendered = render(&tex);

        for x in 0..8 {
            assert_eq!(rendered[(x, 0)].a(), 0, "pixel ({x},0)");
        }
        assert_eq!(rendered[(0, 7)], snap_to_hardware(Rgba::new(200, 40, 40, 255)));
    }

    #[test]
    fn identical_blocks_share_one_run() {
        let rd = Reduction::default();
        let raster = Raster::filled(16, 16, Rgba::new(10, 200, 90, 255));
        let params = ConvertParams::new(TextureFormat::Tex4x4);
        let tex = convert_texture(&rd, &raster, &params, &Progress::default()).unwrap();

        // 16 identical blocks, every index entry identical, one run
        let first = u16::from_le_bytes([tex.index[0], tex.index[1]]);
        for pair in tex.index.chunks_exact(2) {
            assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), first);
        }
        assert!(tex.palette.len() <= 4);
    }

    #[test]
    fn threshold_shrinks_the_palette() {
        let rd = Reduction::default();
        // many slightly different solid blocks
        let mut raster = Raster::filled(32, 32, Rgba::TRANSPARENT);
        for by in 0..8 {
            for bx in 0..8 {
                let color = Rgba::new(100 + (bx * 2) as u8, 80 + (by * 2) as u8, 60, 255);
                for p in 0..16 {
                    raster[(bx * 4 + p % 4, by * 4 + p / 4)] = color;
                }
            }
        }
        let mut params = ConvertParams::new(TextureFormat::Tex4x4);
        let plain = convert_texture(&rd, &raster, &params, &Progress::default()).unwrap();
        params.threshold = 100;
        let squeezed = convert_texture(&rd, &raster, &params, &Progress::default()).unwrap();

        assert!(squeezed.palette.len() < plain.palette.len());
    }
}
