use crate::bitfield::Bits;

/// Alpha values at or above this midpoint count as opaque.
pub const ALPHA_MIDPOINT: u8 = 128;

/// A 32-bit RGBA color, laid out `r | g << 8 | b << 16 | a << 24`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba(pub u32);

impl Rgba {
    pub const TRANSPARENT: Self = Self(0);

    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self(r as u32 | (g as u32) << 8 | (b as u32) << 16 | (a as u32) << 24)
    }

    #[must_use]
    pub const fn r(self) -> u8 {
        self.0 as u8
    }

    #[must_use]
    pub const fn g(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    pub const fn b(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[must_use]
    pub const fn a(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The RGB channels with alpha cleared, for key comparisons.
    #[must_use]
    pub const fn rgb(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    #[must_use]
    pub const fn is_opaque(self) -> bool {
        self.a() >= ALPHA_MIDPOINT
    }

    #[must_use]
    pub const fn with_alpha(self, a: u8) -> Self {
        Self(self.0 & 0x00FF_FFFF | (a as u32) << 24)
    }
}

/// A 15-bit hardware color, `blue << 10 | green << 5 | red`.
/// Bit 15 is the opaque flag used by direct-color texels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Bgr555(pub u16);

impl Bgr555 {
    #[must_use]
    pub fn from_rgb(red: u8, green: u8, blue: u8) -> Self {
        let red: u16 = red.into();
        let green: u16 = green.into();
        let blue: u16 = blue.into();

        Self((blue << 10) + (green << 5) + red)
    }

    #[must_use]
    pub fn red(self) -> u8 {
        self.0.bits(0..=4) as u8
    }

    #[must_use]
    pub fn green(self) -> u8 {
        self.0.bits(5..=9) as u8
    }

    #[must_use]
    pub fn blue(self) -> u8 {
        self.0.bits(10..=14) as u8
    }

    #[must_use]
    pub fn opaque_flag(self) -> bool {
        self.0.bit(15)
    }

    #[must_use]
    pub fn with_opaque_flag(self, on: bool) -> Self {
        Self(self.0.with_bits(15..=15, u32::from(on)))
    }

    /// Truncate each 8-bit channel to 5 bits with rounding.
    /// The opaque flag is left clear.
    #[must_use]
    pub fn quantize(c: Rgba) -> Self {
        let to5 = |v: u8| ((u16::from(v) * 31 + 127) / 255) as u8;
        Self::from_rgb(to5(c.r()), to5(c.g()), to5(c.b()))
    }

    /// Reconstruct 8-bit channels by bit replication. Alpha becomes 0xFF;
    /// use [`Self::expand_with_flag`] to honor the opaque flag instead.
    #[must_use]
    pub fn expand(self) -> Rgba {
        let to8 = |v: u8| v << 3 | v >> 2;
        Rgba::new(to8(self.red()), to8(self.green()), to8(self.blue()), 0xFF)
    }

    /// Like [`Self::expand`], but maps the opaque flag onto alpha.
    #[must_use]
    pub fn expand_with_flag(self) -> Rgba {
        let px = self.expand();
        if self.opaque_flag() { px } else { px.with_alpha(0) }
    }
}

/// Snap an RGBA color to the nearest value representable in hardware
/// (5 bits per channel, replicated back to 8). Alpha passes through.
#[must_use]
pub fn snap_to_hardware(c: Rgba) -> Rgba {
    Bgr555::quantize(c).expand().with_alpha(c.a())
}

/// An extended YIQ tuple used by the perceptual metric. `y` indexes the
/// gamma-shaped luma table (0..=511); `i`, `q` and `a` stay linear.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Yiq {
    pub y: i32,
    pub i: f64,
    pub q: f64,
    pub a: f64,
}

impl From<Rgba> for Yiq {
    fn from(c: Rgba) -> Self {
        let r = f64::from(c.r());
        let g = f64::from(c.g());
        let b = f64::from(c.b());

        // NTSC matrix, doubled so luma spans the 512-entry table.
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let i = 0.595_716 * r - 0.274_453 * g - 0.321_263 * b;
        let q = 0.211_456 * r - 0.522_591 * g + 0.311_135 * b;

        Self {
            y: ((y * 2.0).round() as i32).clamp(0, 511),
            i: i * 2.0,
            q: q * 2.0,
            a: f64::from(c.a()),
        }
    }
}

impl Yiq {
    #[must_use]
    pub fn to_rgba(self) -> Rgba {
        let y = f64::from(self.y) / 2.0;
        let i = self.i / 2.0;
        let q = self.q / 2.0;

        let r = y + 0.956_296 * i + 0.621_024 * q;
        let g = y - 0.272_122 * i - 0.647_381 * q;
        let b = y - 1.106_989 * i + 1.704_614 * q;

        let to8 = |v: f64| v.round().clamp(0.0, 255.0) as u8;
        Rgba::new(
            to8(r),
            to8(g),
            to8(b),
            self.a.round().clamp(0.0, 255.0) as u8,
        )
    }

    #[must_use]
    pub const fn is_opaque(&self) -> bool {
        self.a >= ALPHA_MIDPOINT as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rgba_channels() {
        let c = Rgba::new(0x12, 0x34, 0x56, 0x78);
        assert_eq!(c.0, 0x7856_3412);
        assert_eq!(c.r(), 0x12);
        assert_eq!(c.g(), 0x34);
        assert_eq!(c.b(), 0x56);
        assert_eq!(c.a(), 0x78);
    }

    #[test]
    fn bgr555_channels() {
        let c = Bgr555(0b0000_1000_1000_1000);
        assert_eq!(c.red(), 0b01000);
        assert_eq!(c.green(), 0b00100);
        assert_eq!(c.blue(), 0b00010);
        assert_eq!(Bgr555::from_rgb(1, 1, 1).0, 1057);
    }

    #[test]
    fn hardware_round_trip_is_idempotent() {
        for word in 0..=0x7FFFu16 {
            let c = Bgr555(word);
            assert_eq!(Bgr555::quantize(c.expand()), c);
        }
    }

    #[test]
    fn opaque_flag() {
        let c = Bgr555::from_rgb(31, 0, 0).with_opaque_flag(true);
        assert!(c.opaque_flag());
        assert_eq!(c.expand_with_flag().a(), 0xFF);
        assert_eq!(c.with_opaque_flag(false).expand_with_flag().a(), 0);
        // the flag never leaks into the channels
        assert_eq!(c.red(), 31);
    }

    #[test]
    fn yiq_round_trip_within_one_per_channel() {
        // every color the 15-bit hardware can produce
        for word in 0..=0x7FFFu16 {
            let c = Bgr555(word).expand();
            let back = Yiq::from(c).to_rgba();
            assert!(
                i16::from(c.r()).abs_diff(i16::from(back.r())) <= 1
                    && i16::from(c.g()).abs_diff(i16::from(back.g())) <= 1
                    && i16::from(c.b()).abs_diff(i16::from(back.b())) <= 1,
                "{c:?} -> {back:?}"
            );
            assert_eq!(c.a(), back.a());
        }
    }

    #[test]
    fn yiq_of_gray_has_no_chroma() {
        let c = Yiq::from(Rgba::new(128, 128, 128, 255));
        assert!(c.i.abs() < 0.5);
        assert!(c.q.abs() < 0.5);
        assert_eq!(c.y, 256);
    }
}
