//! Color reduction: the perceptual metric configuration, histogram
//! construction, median-cut palette generation and error diffusion.

pub mod dither;
pub mod histogram;
pub mod quantize;

use crate::color::{Rgba, Yiq};

/// Balance parameters live in this range; 20 is the neutral default.
pub const BALANCE_MIN: i32 = 1;
pub const BALANCE_MAX: i32 = 39;
pub const BALANCE_DEFAULT: i32 = 20;

/// Fixed weight on squared alpha distance. Large enough that an alpha
/// mismatch dwarfs any chroma or luma error, so transparent pixels bind
/// to transparent entries before color is even considered.
const ALPHA_WEIGHT: f64 = 1600.0;

const LUMA_LEVELS: usize = 512;

/// The perceptual color-metric configuration for one conversion.
///
/// Every function that compares colors takes this by reference; nothing
/// about the metric is global state. The gamma-shaped luma table is part
/// of the configuration so histogram operations, distance evaluations and
/// averaging all agree on the same curve.
#[derive(Debug, Clone)]
pub struct Reduction {
    lightness_vs_color: i32,
    red_vs_green: i32,
    enhance_colors: bool,
    gamma: f64,
    y_weight: f64,
    i_weight: f64,
    q_weight: f64,
    luma_table: Box<[f64; LUMA_LEVELS]>,
}

impl Default for Reduction {
    fn default() -> Self {
        Self::new(BALANCE_DEFAULT, BALANCE_DEFAULT, false)
    }
}

impl Reduction {
    /// `lightness_vs_color` trades luma accuracy against chroma accuracy;
    /// `red_vs_green` splits the chroma budget between the I and Q axes.
    /// Both are clamped to `[1, 39]`.
    #[must_use]
    pub fn new(lightness_vs_color: i32, red_vs_green: i32, enhance_colors: bool) -> Self {
        let lightness = lightness_vs_color.clamp(BALANCE_MIN, BALANCE_MAX);
        let red_green = red_vs_green.clamp(BALANCE_MIN, BALANCE_MAX);

        let y_weight = 20.0 + f64::from(lightness);
        let chroma_budget = 60.0 - f64::from(lightness);
        let mut i_weight = chroma_budget * f64::from(red_green) / 40.0;
        let mut q_weight = chroma_budget * f64::from(40 - red_green) / 40.0;
        if enhance_colors {
            // resist desaturation in gradient regions
            i_weight *= 1.5;
            q_weight *= 1.5;
        }

        let gamma = 1.27;
        let mut luma_table = Box::new([0.0; LUMA_LEVELS]);
        for (y, slot) in luma_table.iter_mut().enumerate() {
            *slot = (y as f64 / 511.0).powf(gamma) * 511.0;
        }

        Self {
            lightness_vs_color: lightness,
            red_vs_green: red_green,
            enhance_colors,
            gamma,
            y_weight,
            i_weight,
            q_weight,
            luma_table,
        }
    }

    #[must_use]
    pub const fn lightness_vs_color(&self) -> i32 {
        self.lightness_vs_color
    }

    #[must_use]
    pub const fn red_vs_green(&self) -> i32 {
        self.red_vs_green
    }

    #[must_use]
    pub const fn enhance_colors(&self) -> bool {
        self.enhance_colors
    }

    #[must_use]
    pub const fn weights(&self) -> (f64, f64, f64) {
        (self.y_weight, self.i_weight, self.q_weight)
    }

    /// Gamma-linear luma for a table index.
    #[must_use]
    pub fn luma(&self, y: i32) -> f64 {
        self.luma_table[y.clamp(0, 511) as usize]
    }

    /// Inverse of [`Self::luma`]: recompress a gamma-linear luma back to
    /// the table index scale (not rounded).
    #[must_use]
    pub fn luma_inverse(&self, l: f64) -> f64 {
        (l.max(0.0) / 511.0).powf(1.0 / self.gamma) * 511.0
    }

    /// The perceptual distance `D`. Symmetric, zero only for identical
    /// operands, dominated by the alpha term on transparency mismatch.
    #[must_use]
    pub fn diff(&self, a: &Yiq, b: &Yiq) -> f64 {
        let dl = self.luma(a.y) - self.luma(b.y);
        let di = a.i - b.i;
        let dq = a.q - b.q;
        let da = a.a - b.a;

        self.y_weight * self.y_weight * dl * dl
            + self.i_weight * self.i_weight * di * di
            + self.q_weight * self.q_weight * dq * dq
            + ALPHA_WEIGHT * da * da
    }

    #[must_use]
    pub fn diff_rgba(&self, a: Rgba, b: Rgba) -> f64 {
        self.diff(&a.into(), &b.into())
    }

    /// Position of the palette color closest to `target`. Ties resolve to
    /// the earliest entry. Returns 0 for an empty palette.
    #[must_use]
    pub fn closest(&self, target: &Yiq, palette: &[Yiq]) -> usize {
        let mut best = 0;
        let mut best_diff = f64::INFINITY;
        for (n, color) in palette.iter().enumerate() {
            let d = self.diff(target, color);
            if d < best_diff {
                best_diff = d;
                best = n;
            }
        }
        best
    }

    /// Accumulated distance between each opaque pixel and its best match
    /// in `palette`, aborting early once the running sum exceeds
    /// `cutoff`. Pixels below the alpha midpoint bind to the caller's
    /// transparent slot and contribute nothing.
    #[must_use]
    pub fn palette_error(&self, pixels: &[Yiq], palette: &[Yiq], cutoff: f64) -> f64 {
        let mut total = 0.0;
        for px in pixels {
            if !px.is_opaque() {
                continue;
            }
            let mut best = f64::INFINITY;
            for color in palette {
                let d = self.diff(px, color);
                if d < best {
                    best = d;
                }
            }
            if best.is_finite() {
                total += best;
            }
            if total > cutoff {
                return total;
            }
        }
        total
    }
}

/// Convert a palette slice into the metric space once, for repeated
/// lookups against it.
#[must_use]
pub fn yiq_palette(palette: &[Rgba]) -> Vec<Yiq> {
    palette.iter().map(|&c| Yiq::from(c)).collect()
}

/// A sub-range of the hardware palette memory a conversion may write:
/// `count` palettes starting at `base`, each using `length` slots
/// starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteRegion {
    pub base: usize,
    pub count: usize,
    pub length: usize,
    pub offset: usize,
}

/// A flat palette buffer of `base + count` palettes, each `1 << bits`
/// slots wide, plus the region describing the writable window.
///
/// When the region offset is zero, slot 0 of every palette is the
/// reserved transparent entry: the quantizer never writes it and index
/// arithmetic shifts matches past it.
#[derive(Debug, Clone)]
pub struct PaletteSet {
    colors: Vec<Rgba>,
    bits: u32,
    region: PaletteRegion,
}

impl PaletteSet {
    #[must_use]
    pub fn new(bits: u32, region: PaletteRegion) -> Self {
        let stride = 1usize << bits;
        Self {
            colors: vec![Rgba::TRANSPARENT; (region.base + region.count) * stride],
            bits,
            region,
        }
    }

    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    #[must_use]
    pub const fn region(&self) -> &PaletteRegion {
        &self.region
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        1 << self.bits
    }

    /// Whether slot 0 doubles as the transparent entry.
    #[must_use]
    pub const fn reserves_slot0(&self) -> bool {
        self.region.offset == 0
    }

    /// First slot the quantizer may search or write.
    #[must_use]
    pub const fn window_first(&self) -> usize {
        self.region.offset + self.reserves_slot0() as usize
    }

    /// Number of searchable slots per palette.
    #[must_use]
    pub const fn window_len(&self) -> usize {
        self.region.length - self.reserves_slot0() as usize
    }

    /// Full `1 << bits` slot slice of palette `n` (absolute index).
    #[must_use]
    pub fn palette(&self, n: usize) -> &[Rgba] {
        let stride = self.stride();
        &self.colors[n * stride..(n + 1) * stride]
    }

    /// The searchable window of palette `n`.
    #[must_use]
    pub fn window(&self, n: usize) -> &[Rgba] {
        let start = n * self.stride() + self.window_first();
        &self.colors[start..start + self.window_len()]
    }

    pub fn set_window(&mut self, n: usize, colors: &[Rgba]) {
        let start = n * self.stride() + self.window_first();
        self.colors[start..start + colors.len()].copy_from_slice(colors);
    }

    pub fn set_slot(&mut self, n: usize, slot: usize, color: Rgba) {
        let stride = self.stride();
        self.colors[n * stride + slot] = color;
    }

    /// Absolute palette minimizing the fit error for `pixels`, searching
    /// the region's palettes with an early-exit running cutoff.
    #[must_use]
    pub fn best_palette(&self, rd: &Reduction, pixels: &[Yiq]) -> usize {
        let mut best = self.region.base;
        let mut best_err = f64::INFINITY;
        for n in self.region.base..self.region.base + self.region.count {
            let window = yiq_palette(self.window(n));
            let err = rd.palette_error(pixels, &window, best_err);
            if err < best_err {
                best_err = err;
                best = n;
            }
        }
        best
    }

    /// Map a window position to its palette slot number.
    #[must_use]
    pub const fn slot_for(&self, window_pos: usize) -> u8 {
        (self.window_first() + window_pos) as u8
    }

    /// Pack a slot into a stored tile index: 4-bit depth carries the
    /// palette number in the high nibble.
    #[must_use]
    pub const fn packed_index(&self, palette: usize, slot: u8) -> u8 {
        if self.bits == 4 {
            ((palette as u8) << 4) | slot
        } else {
            slot
        }
    }

    /// The colors of the caller-selected region, palettes `base` to
    /// `base + count`, each a full stride wide.
    #[must_use]
    pub fn emitted(&self) -> &[Rgba] {
        let stride = self.stride();
        &self.colors[self.region.base * stride..(self.region.base + self.region.count) * stride]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Rgba;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    #[test]
    fn metric_is_symmetric_zero_diagonal() {
        let rd = Reduction::default();
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let a = Rgba(rng.r#gen::<u32>());
            let b = Rgba(rng.r#gen::<u32>());
            let d_ab = rd.diff_rgba(a, b);
            let d_ba = rd.diff_rgba(b, a);
            assert!(d_ab >= 0.0);
            assert!((d_ab - d_ba).abs() < 1e-9);
            assert!(rd.diff_rgba(a, a).abs() < 1e-12);
        }
    }

    #[test]
    fn alpha_mismatch_dominates() {
        let rd = Reduction::default();
        let opaque_black = Rgba::new(0, 0, 0, 255);
        let opaque_white = Rgba::new(255, 255, 255, 255);
        let clear_black = Rgba::new(0, 0, 0, 0);
        assert!(rd.diff_rgba(opaque_black, clear_black) > rd.diff_rgba(opaque_black, opaque_white));
    }

    #[test]
    fn balance_shifts_weights() {
        let neutral = Reduction::default();
        let lightness_heavy = Reduction::new(39, 20, false);
        let red_heavy = Reduction::new(20, 39, false);

        let (y0, i0, q0) = neutral.weights();
        let (yl, il, ql) = lightness_heavy.weights();
        assert!(yl > y0 && il < i0 && ql < q0);

        let (_, ir, qr) = red_heavy.weights();
        assert!(ir > i0 && qr < q0);
    }

    #[test]
    fn enhance_boosts_chroma() {
        let plain = Reduction::default();
        let enhanced = Reduction::new(20, 20, true);
        assert!(enhanced.weights().1 > plain.weights().1);
        assert!(enhanced.weights().2 > plain.weights().2);
    }

    #[test]
    fn luma_table_shape() {
        let rd = Reduction::default();
        assert_eq!(rd.luma(0), 0.0);
        assert!((rd.luma(511) - 511.0).abs() < 1e-9);
        // gamma > 1 bends the curve below the identity
        assert!(rd.luma(256) < 256.0);
        // inverse really inverts
        for y in [1, 17, 255, 400, 511] {
            assert!((rd.luma_inverse(rd.luma(y)) - f64::from(y)).abs() < 1e-6);
        }
    }

    #[test]
    fn closest_prefers_exact_match() {
        let rd = Reduction::default();
        let pal = yiq_palette(&[
            Rgba::new(255, 0, 0, 255),
            Rgba::new(0, 255, 0, 255),
            Rgba::new(0, 0, 255, 255),
        ]);
        assert_eq!(rd.closest(&Rgba::new(0, 250, 4, 255).into(), &pal), 1);
    }

    #[test]
    fn palette_error_cutoff_aborts_early() {
        let rd = Reduction::default();
        let pixels: Vec<_> = (0..64).map(|_| Rgba::new(255, 0, 0, 255).into()).collect();
        let pal = yiq_palette(&[Rgba::new(0, 0, 255, 255)]);
        let full = rd.palette_error(&pixels, &pal, f64::INFINITY);
        let cut = rd.palette_error(&pixels, &pal, 1.0);
        assert!(cut >= 1.0);
        assert!(cut < full);
    }

    #[test]
    fn palette_set_windows_and_packing() {
        let region = PaletteRegion {
            base: 2,
            count: 3,
            length: 16,
            offset: 0,
        };
        let mut set = PaletteSet::new(4, region);
        assert!(set.reserves_slot0());
        assert_eq!(set.window_first(), 1);
        assert_eq!(set.window_len(), 15);

        set.set_window(2, &[Rgba::new(1, 1, 1, 255)]);
        assert_eq!(set.palette(2)[1], Rgba::new(1, 1, 1, 255));
        assert_eq!(set.palette(2)[0], Rgba::TRANSPARENT);
        assert_eq!(set.packed_index(3, 5), 0x35);
        assert_eq!(set.slot_for(0), 1);

        let offset_region = PaletteRegion {
            base: 0,
            count: 1,
            length: 4,
            offset: 8,
        };
        let set = PaletteSet::new(4, offset_region);
        assert!(!set.reserves_slot0());
        assert_eq!(set.window_first(), 8);
        assert_eq!(set.window_len(), 4);
    }
}
