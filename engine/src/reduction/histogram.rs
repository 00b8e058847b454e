use std::collections::HashMap;

use crate::color::{Rgba, Yiq};
use crate::reduction::Reduction;

/// One histogram bucket: a distinct source color, its metric-space
/// position, its cached gamma-linear luma and the accumulated weight.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub color: Rgba,
    pub yiq: Yiq,
    pub luma: f64,
    pub weight: f64,
}

/// Color histogram over the opaque pixels of an input. Pixels below the
/// alpha midpoint bind to the reserved transparent slot and never reach
/// the quantizer, so they are excluded here.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    pub buckets: Vec<Bucket>,
}

impl Histogram {
    #[must_use]
    pub fn new(rd: &Reduction, pixels: &[Rgba]) -> Self {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        for px in pixels {
            if px.is_opaque() {
                *counts.entry(px.rgb()).or_insert(0) += 1;
            }
        }

        let mut buckets: Vec<Bucket> = counts
            .into_iter()
            .map(|(rgb, count)| {
                let color = Rgba(rgb).with_alpha(0xFF);
                let yiq = Yiq::from(color);
                let mut weight = f64::from(count);
                if rd.enhance_colors() {
                    // bias saturated buckets so gradients keep their color
                    weight *= 1.0 + (yiq.i * yiq.i + yiq.q * yiq.q).sqrt() / 256.0;
                }
                Bucket {
                    color,
                    yiq,
                    luma: rd.luma(yiq.y),
                    weight,
                }
            })
            .collect();

        // deterministic order regardless of hash state
        buckets.sort_unstable_by_key(|b| b.color.0);

        Self { buckets }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
