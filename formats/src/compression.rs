//! Compression policy plumbing. The entropy coders themselves are
//! external collaborators; this module carries the policy flags the
//! container format records and the pass-through encoder used when no
//! coder is enabled.

use std::borrow::Cow;

/// Flags controlling which encodings a container payload may use. The
/// writer picks whichever enabled scheme minimizes output; with only
/// [`Self::NONE`] enabled, data passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy(pub u32);

impl CompressionPolicy {
    pub const NONE: Self = Self(0x01);
    pub const LZ: Self = Self(0x02);
    pub const HUFFMAN4: Self = Self(0x04);
    pub const HUFFMAN8: Self = Self(0x08);
    pub const RLE: Self = Self(0x10);
    /// Constrain the choice to schemes safe to stream into VRAM.
    pub const VRAM_SAFE: Self = Self(0x80);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Encode `data` under `policy`, returning the scheme's header type byte
/// and the payload. Only the uncompressed scheme is wired in; the
/// signature is the contract the external coders slot into.
#[must_use]
pub fn compress(data: &[u8], _policy: CompressionPolicy) -> (u8, Cow<'_, [u8]>) {
    (0x00, Cow::Borrowed(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_compose() {
        let policy = CompressionPolicy::NONE.union(CompressionPolicy::LZ);
        assert!(policy.contains(CompressionPolicy::NONE));
        assert!(policy.contains(CompressionPolicy::LZ));
        assert!(!policy.contains(CompressionPolicy::RLE));
    }

    #[test]
    fn pass_through_keeps_bytes() {
        let data = [1u8, 2, 3];
        let (kind, out) = compress(&data, CompressionPolicy::default());
        assert_eq!(kind, 0);
        assert_eq!(out.as_ref(), &data);
    }
}
