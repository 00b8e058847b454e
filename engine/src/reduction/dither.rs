//! Floyd-Steinberg error diffusion against a fixed palette.

use crate::color::Rgba;
use crate::reduction::{Reduction, yiq_palette};

/// Match every pixel to its closest palette color, diffusing the residual
/// with the Floyd-Steinberg kernel scaled by `amount` (0 disables
/// diffusion and degrades to a plain closest-color pass).
///
/// The residual is computed in RGB, not YIQ: with 5-bit hardware colors
/// the chroma axes are too coarse for stable feedback. Pixels below the
/// alpha midpoint return `None` and neither receive nor propagate error;
/// the caller binds them to its transparent slot.
#[must_use]
pub fn dither_indices(
    rd: &Reduction,
    pixels: &[Rgba],
    width: usize,
    palette: &[Rgba],
    amount: f64,
) -> Vec<Option<usize>> {
    let amount = amount.clamp(0.0, 1.0);
    let height = if width == 0 { 0 } else { pixels.len() / width };
    let palette_yiq = yiq_palette(palette);

    let mut residual = vec![[0.0f64; 3]; pixels.len()];
    let mut out = Vec::with_capacity(pixels.len());

    for y in 0..height {
        for x in 0..width {
            let n = x + y * width;
            let px = pixels[n];
            if !px.is_opaque() {
                out.push(None);
                continue;
            }
            if palette.is_empty() {
                out.push(Some(0));
                continue;
            }

            let adjusted = Rgba::new(
                (f64::from(px.r()) + residual[n][0]).round().clamp(0.0, 255.0) as u8,
                (f64::from(px.g()) + residual[n][1]).round().clamp(0.0, 255.0) as u8,
                (f64::from(px.b()) + residual[n][2]).round().clamp(0.0, 255.0) as u8,
                0xFF,
            );
            let slot = rd.closest(&adjusted.into(), &palette_yiq);
            let chosen = palette[slot];
            out.push(Some(slot));

            if amount > 0.0 {
                let err = [
                    (f64::from(adjusted.r()) - f64::from(chosen.r())) * amount,
                    (f64::from(adjusted.g()) - f64::from(chosen.g())) * amount,
                    (f64::from(adjusted.b()) - f64::from(chosen.b())) * amount,
                ];
                let mut spread = |dx: isize, dy: isize, share: f64| {
                    let tx = x as isize + dx;
                    let ty = y as isize + dy;
                    if tx >= 0 && (tx as usize) < width && (ty as usize) < height {
                        let t = tx as usize + ty as usize * width;
                        for k in 0..3 {
                            residual[t][k] += err[k] * share;
                        }
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
