//! Median-cut palette construction with perceptual weighting, plus the
//! Lloyd-style assignment of several palettes to tile regions.

use crate::color::{Rgba, Yiq};
use crate::progress::Counter;
use crate::reduction::histogram::{Bucket, Histogram};
use crate::reduction::{PaletteSet, Reduction, yiq_palette};

/// Rounds of weighted k-means refinement after the median-cut pass.
const KMEANS_ROUNDS: usize = 8;

/// Iteration cap for the multi-palette Lloyd loop.
const LLOYD_ROUNDS: usize = 16;

/// Power-iteration rounds for the principal axis.
const POWER_ROUNDS: usize = 16;

/// Weighted YIQA accumulator. Luma is accumulated gamma-linear and
/// recompressed when the mean is read back out. A cluster that only ever
/// saw one distinct color reports that color exactly, so palettes can
/// represent an already-quantized input without drift.
#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    l: f64,
    i: f64,
    q: f64,
    a: f64,
    weight: f64,
    uniform: Option<Rgba>,
    mixed: bool,
}

impl Accumulator {
    fn add(&mut self, bucket: &Bucket) {
        self.l += bucket.luma * bucket.weight;
        self.i += bucket.yiq.i * bucket.weight;
        self.q += bucket.yiq.q * bucket.weight;
        self.a += bucket.yiq.a * bucket.weight;
        self.weight += bucket.weight;
        match self.uniform {
            None if !self.mixed => self.uniform = Some(bucket.color),
            Some(c) if c != bucket.color => {
                self.uniform = None;
                self.mixed = true;
            }
            _ => {}
        }
    }

    fn mean(&self, rd: &Reduction) -> Option<Rgba> {
        if self.weight <= 0.0 {
            return None;
        }
        if let Some(color) = self.uniform {
            return Some(color);
        }
        let yiq = Yiq {
            y: (rd.luma_inverse(self.l / self.weight).round() as i32).clamp(0, 511),
            i: self.i / self.weight,
            q: self.q / self.weight,
            a: self.a / self.weight,
        };
        Some(yiq.to_rgba())
    }
}

/// Metric-space coordinates of a bucket: luma and chroma scaled by the
/// reduction weights, so Euclidean variance here matches `D`.
fn coords(rd: &Reduction, bucket: &Bucket) -> [f64; 3] {
    let (yw, iw, qw) = rd.weights();
    [bucket.luma * yw, bucket.yiq.i * iw, bucket.yiq.q * qw]
}

/// Principal axis of the weighted covariance of `buckets`, found by power
/// iteration, together with the variance along it.
fn principal_axis(rd: &Reduction, buckets: &[Bucket]) -> ([f64; 3], f64) {
    let mut mean = [0.0; 3];
    let mut total = 0.0;
    for b in buckets {
        let c = coords(rd, b);
        for k in 0..3 {
            mean[k] += c[k] * b.weight;
        }
        total += b.weight;
    }
    if total <= 0.0 {
        return ([1.0, 0.0, 0.0], 0.0);
    }
    for m in &mut mean {
        *m /= total;
    }

    // symmetric 3x3 covariance
    let mut cov = [[0.0; 3]; 3];
    for b in buckets {
        let c = coords(rd, b);
        let d = [c[0] - mean[0], c[1] - mean[1], c[2] - mean[2]];
        for r in 0..3 {
            for s in 0..3 {
                cov[r][s] += d[r] * d[s] * b.weight;
            }
        }
    }
    for row in &mut cov {
        for v in row.iter_mut() {
            *v /= total;
        }
    }

    // start along the largest diagonal entry
    let mut axis = [0.0; 3];
    let start = (0..3).fold(0, |m, k| if cov[k][k] > cov[m][m] { k } else { m });
    axis[start] = 1.0;

    for _ in 0..POWER_ROUNDS {
        let next = [
            cov[0][0] * axis[0] + cov[0][1] * axis[1] + cov[0][2] * axis[2],
            cov[1][0] * axis[0] + cov[1][1] * axis[1] + cov[1][2] * axis[2],
            cov[2][0] * axis[0] + cov[2][1] * axis[1] + cov[2][2] * axis[2],
        ];
        let norm = (next[0] * next[0] + next[1] * next[1] + next[2] * next[2]).sqrt();
        if norm <= f64::EPSILON {
            break;
        }
        axis = [next[0] / norm, next[1] / norm, next[2] / norm];
    }

    let variance = (0..3)
        .map(|r| (0..3).map(|s| axis[r] * cov[r][s] * axis[s]).sum::<f64>())
        .sum();
    ([axis[0], axis[1], axis[2]], variance)
}

/// One median-cut box: a range of the working bucket array plus its
/// cached principal axis and the variance along it.
#[derive(Debug, Clone, Copy)]
struct CutBox {
    start: usize,
    end: usize,
    axis: [f64; 3],
    variance: f64,
}

impl CutBox {
    fn new(rd: &Reduction, buckets: &[Bucket], start: usize, end: usize) -> Self {
        let (axis, variance) = principal_axis(rd, &buckets[start..end]);
        Self {
            start,
            end,
            axis,
            variance,
        }
    }

    const fn width(&self) -> usize {
        self.end - self.start
    }
}

/// Split `cut` at the weighted median along its principal axis. The box
/// range in `buckets` is reordered in place.
fn split_box(rd: &Reduction, buckets: &mut [Bucket], cut: &CutBox) -> (CutBox, CutBox) {
    let range = &mut buckets[cut.start..cut.end];
    range.sort_unstable_by(|a, b| {
        let pa = coords(rd, a)
            .iter()
            .zip(&cut.axis)
            .map(|(c, x)| c * x)
            .sum::<f64>();
        let pb = coords(rd, b)
            .iter()
            .zip(&cut.axis)
            .map(|(c, x)| c * x)
            .sum::<f64>();
        pa.total_cmp(&pb)
    });

    let total: f64 = range.iter().map(|b| b.weight).sum();
    let mut acc = 0.0;
    let mut pivot = 1;
    for (n, b) in range.iter().enumerate() {
        acc += b.weight;
        if acc >= total / 2.0 {
            pivot = n + 1;
            break;
        }
    }
    // both halves must stay non-empty
    let pivot = pivot.clamp(1, range.len() - 1);

    (
        CutBox::new(rd, buckets, cut.start, cut.start + pivot),
        CutBox::new(rd, buckets, cut.start + pivot, cut.end),
    )
}

/// Build a palette of exactly `n_colors` colors for `pixels`.
///
/// Median cut over the histogram, always splitting the box with the
/// greatest variance along its principal axis, followed by a few rounds
/// of weighted k-means. Degenerate inputs (fewer distinct colors than
/// requested) pad by duplication. When `sort_by_luma` is set the output
/// is ordered dark to light.
#[must_use]
pub fn create_palette(
    rd: &Reduction,
    pixels: &[Rgba],
    n_colors: usize,
    sort_by_luma: bool,
) -> Vec<Rgba> {
    if n_colors == 0 {
        return vec![];
    }

    let hist = Histogram::new(rd, pixels);
    if hist.is_empty() {
        return vec![Rgba::new(0, 0, 0, 255); n_colors];
    }

    let mut buckets = hist.buckets;
    let mut boxes = vec![CutBox::new(rd, &buckets, 0, buckets.len())];
    while boxes.len() < n_colors {
        let Some(widest) = boxes
            .iter()
            .enumerate()
            .filter(|(_, b)| b.width() > 1 && b.variance > f64::EPSILON)
            .max_by(|(_, a), (_, b)| a.variance.total_cmp(&b.variance))
            .map(|(n, _)| n)
        else {
            break;
        };
        let cut = boxes.swap_remove(widest);
        let (lo, hi) = split_box(rd, &mut buckets, &cut);
        boxes.push(lo);
        boxes.push(hi);
    }

    let mut colors: Vec<Rgba> = boxes
        .iter()
        .filter_map(|b| {
            let mut acc = Accumulator::default();
            for bucket in &buckets[b.start..b.end] {
                acc.add(bucket);
            }
            acc.mean(rd)
        })
        .collect();

    refine_kmeans(rd, &buckets, &mut colors);

    if sort_by_luma {
        colors.sort_by_key(|c| Yiq::from(*c).y);
    }

    // degenerate input: duplicate until the requested count is reached
    while colors.len() < n_colors {
        let last = *colors.last().expect("at least one color");
        colors.push(last);
    }
    colors.truncate(n_colors);
    colors
}

/// Reassign buckets to their nearest palette color and recompute the
/// weighted centroids, up to [`KMEANS_ROUNDS`] times or until stable.
fn refine_kmeans(rd: &Reduction, buckets: &[Bucket], colors: &mut Vec<Rgba>) {
    if colors.is_empty() {
        return;
    }
    let mut assignment = vec![usize::MAX; buckets.len()];
    for _ in 0..KMEANS_ROUNDS {
        let palette = yiq_palette(colors);
        let mut changed = false;
        for (b, slot) in buckets.iter().zip(assignment.iter_mut()) {
            let best = rd.closest(&b.yiq, &palette);
            if best != *slot {
                *slot = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut accs = vec![Accumulator::default(); colors.len()];
        for (b, &slot) in buckets.iter().zip(&assignment) {
            accs[slot].add(b);
        }
        for (color, acc) in colors.iter_mut().zip(&accs) {
            // a cluster that lost every bucket keeps its old color
            if let Some(mean) = acc.mean(rd) {
                *color = mean;
            }
        }
    }
}

/// Fill the palette set's region with `region.count` palettes assigned to
/// 8x8 tiles, Lloyd-style: seed palettes from a median cut of the pooled
/// histogram, then alternate palette rebuilds with best-fit reassignment
/// until assignments stabilize or the iteration cap.
///
/// `progress` advances once per tile per assignment round.
pub fn create_multiple_palettes(
    rd: &Reduction,
    tiles: &[[Rgba; 64]],
    set: &mut PaletteSet,
    progress: &Counter,
) -> Vec<usize> {
    let count = set.region().count;
    let base = set.region().base;
    progress.set_max((tiles.len() * (LLOYD_ROUNDS + 1)) as u32);

    if tiles.is_empty() || count == 0 {
        progress.finish();
        return vec![];
    }

    let pooled: Vec<Rgba> = tiles.iter().flatten().copied().collect();
    let seeds = create_palette(rd, &pooled, count, false);
    let seeds_yiq = yiq_palette(&seeds);

    // initial assignment: nearest seed to the tile's mean color
    let tiles_yiq: Vec<Vec<Yiq>> = tiles
        .iter()
        .map(|px| px.iter().map(|&c| Yiq::from(c)).collect())
        .collect();
    let mut assignment: Vec<usize> = tiles
        .iter()
        .map(|px| {
            let opaque: Vec<&Rgba> = px.iter().filter(|c| c.is_opaque()).collect();
            if opaque.is_empty() {
                return 0;
            }
            let mut acc = [0.0f64; 3];
            for c in &opaque {
                acc[0] += f64::from(c.r());
                acc[1] += f64::from(c.g());
                acc[2] += f64::from(c.b());
            }
            let n = opaque.len() as f64;
            let mean = Rgba::new(
                (acc[0] / n).round() as u8,
                (acc[1] / n).round() as u8,
                (acc[2] / n).round() as u8,
                0xFF,
            );
            rd.closest(&mean.into(), &seeds_yiq)
        })
        .map(|p| p.min(count - 1))
        .collect();
    progress.add(tiles.len() as u32);

    for _ in 0..LLOYD_ROUNDS {
        rebuild_palettes(rd, tiles, &assignment, &seeds, set);

        let windows: Vec<Vec<Yiq>> = (0..count)
            .map(|p| yiq_palette(set.window(base + p)))
            .collect();

        let mut changes = 0usize;
        for (tile, slot) in tiles_yiq.iter().zip(assignment.iter_mut()) {
            let mut best = *slot;
            let mut best_err = rd.palette_error(tile, &windows[*slot], f64::INFINITY);
            for (p, window) in windows.iter().enumerate() {
                if p == *slot {
                    continue;
                }
                let err = rd.palette_error(tile, window, best_err);
                if err < best_err {
                    best_err = err;
                    best = p;
                }
            }
            if best != *slot {
                *slot = best;
                changes += 1;
            }
            progress.add(1);
        }
        if changes == 0 {
            break;
        }
    }

    rebuild_palettes(rd, tiles, &assignment, &seeds, set);
    progress.finish();
    assignment
}

fn rebuild_palettes(
    rd: &Reduction,
    tiles: &[[Rgba; 64]],
    assignment: &[usize],
    seeds: &[Rgba],
    set: &mut PaletteSet,
) {
    let count = set.region().count;
    let base = set.region().base;
    let window_len = set.window_len();

    for p in 0..count {
        let members: Vec<Rgba> = tiles
            .iter()
            .zip(assignment)
            .filter(|&(_, &slot)| slot == p)
            .flat_map(|(px, _)| px.iter().copied())
            .collect();

        let colors = if members.is_empty() {
            vec![seeds[p]; window_len]
        } else {
            create_palette(rd, &members, window_len, true)
        };
        set.set_window(base + p, &colors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::PaletteRegion;
    use pretty_assertions::assert_eq;

    fn solid(r: u8, g: u8, b: u8) -> [Rgba; 64] {
        [Rgba::new(r, g, b, 255); 64]
    }

    #[test]
    fn exact_palette_for_few_colors() {
        let rd = Reduction::default();
        let pixels = [
            Rgba::new(255, 0, 0, 255),
            Rgba::new(0, 255, 0, 255),
            Rgba::new(0, 0, 255, 255),
            Rgba::new(255, 255, 255, 255),
        ];
        let mut pal = create_palette(&rd, &pixels, 4, false);
        pal.sort_unstable_by_key(|c| c.0);
        let mut expected = pixels.to_vec();
        expected.sort_unstable_by_key(|c| c.0);
        assert_eq!(pal, expected);
    }

    #[test]
    fn degenerate_input_duplicates() {
        let rd = Reduction::default();
        let pal = create_palette(&rd, &[Rgba::new(10, 20, 30, 255)], 8, false);
        assert_eq!(pal.len(), 8);
        assert!(pal.iter().all(|&c| c == pal[0]));
    }

    #[test]
    fn fully_transparent_input_yields_black() {
        let rd = Reduction::default();
        let pal = create_palette(&rd, &[Rgba::TRANSPARENT; 16], 4, false);
        assert_eq!(pal, vec![Rgba::new(0, 0, 0, 255); 4]);
    }

    #[test]
    fn luma_sort_orders_dark_to_light() {
        let rd = Reduction::default();
        let pixels = [
            Rgba::new(255, 255, 255, 255),
            Rgba::new(0, 0, 0, 255),
            Rgba::new(128, 128, 128, 255),
        ];
        let pal = create_palette(&rd, &pixels, 3, true);
        let lumas: Vec<i32> = pal.iter().map(|&c| Yiq::from(c).y).collect();
        assert!(lumas.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn palette_256_covers_256_distinct_colors() {
        let rd = Reduction::default();
        let pixels: Vec<Rgba> = (0..256)
            .map(|n| Rgba::new(n as u8, (255 - n) as u8, (n * 7 % 256) as u8, 255))
            .collect();
        let pal = create_palette(&rd, &pixels, 256, true);
        assert_eq!(pal.len(), 256);
        // every input color must be representable exactly
        let pal_yiq = yiq_palette(&pal);
        for px in &pixels {
            let n = rd.closest(&(*px).into(), &pal_yiq);
            assert_eq!(pal[n].rgb(), px.rgb());
        }
    }

    #[test]
    fn multiple_palettes_separate_disjoint_tiles() {
        let rd = Reduction::default();
        // two tile populations with nothing in common
        let tiles = vec![
            solid(255, 0, 0),
            solid(200, 0, 0),
            solid(0, 0, 255),
            solid(0, 0, 200),
        ];
        let region = PaletteRegion {
            base: 0,
            count: 2,
            length: 16,
            offset: 0,
        };
        let mut set = PaletteSet::new(4, region);
        let progress = Counter::default();
        let assignment = create_multiple_palettes(&rd, &tiles, &mut set, &progress);

        assert_eq!(assignment.len(), 4);
        assert_eq!(assignment[0], assignment[1]);
        assert_eq!(assignment[2], assignment[3]);
        assert_ne!(assignment[0], assignment[2]);

        let (current, max) = progress.get();
        assert_eq!(current, max);
    }
}
