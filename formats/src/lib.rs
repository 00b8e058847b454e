//! Serialization of engine output: raw binary files, the GRF block
//! container and a C-source emitter. The engine hands over ready byte
//! arrays; everything here is layout and I/O.

pub mod binary;
pub mod compression;
pub mod csource;
pub mod grf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WriteError>;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub(crate) fn write_file(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|source| WriteError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Serialize a hardware palette little-endian, two bytes per color.
#[must_use]
pub fn palette_bytes(palette: &[engine::color::Bgr555]) -> Vec<u8> {
    palette.iter().flat_map(|c| c.0.to_le_bytes()).collect()
}
