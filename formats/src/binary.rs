//! Raw binary output: one file per component with the conventional
//! suffixes (`_pal.bin`, `_chr.bin`, `_scr.bin` for backgrounds;
//! `_tex.bin`, `_idx.bin`, `_pal.bin` for textures).

use std::path::{Path, PathBuf};

use engine::bg::BgOutput;
use engine::texture::{Texture, TextureFormat};

use crate::{Result, palette_bytes, write_file};

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.file_name().map_or_else(String::new, |n| {
        n.to_string_lossy().into_owned()
    });
    name.push_str(suffix);
    base.with_file_name(name)
}

/// Write a background conversion next to `base`. The screen file is
/// omitted for bitmap output, which has no screen data.
///
/// # Errors
///
/// I/O failure on any of the output files.
pub fn write_bg(base: &Path, bg: &BgOutput) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    let pal = with_suffix(base, "_pal.bin");
    write_file(&pal, &palette_bytes(&bg.palette))?;
    written.push(pal);

    let chr = with_suffix(base, "_chr.bin");
    write_file(&chr, &bg.chars)?;
    written.push(chr);

    if !bg.screen.is_empty() {
        let scr = with_suffix(base, "_scr.bin");
        write_file(&scr, &bg.screen)?;
        written.push(scr);
    }
    Ok(written)
}

/// Write a texture conversion next to `base`: texels, the block index
/// for 4x4 textures and the palette for paletted formats.
///
/// # Errors
///
/// I/O failure on any of the output files.
pub fn write_texture(base: &Path, texture: &Texture) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    let tex = with_suffix(base, "_tex.bin");
    write_file(&tex, &texture.texel)?;
    written.push(tex);

    if texture.params.format() == TextureFormat::Tex4x4 {
        let idx = with_suffix(base, "_idx.bin");
        write_file(&idx, &texture.index)?;
        written.push(idx);
    }
    if texture.params.format().requires_palette() {
        let pal = with_suffix(base, "_pal.bin");
        write_file(&pal, &palette_bytes(&texture.palette))?;
        written.push(pal);
    }
    Ok(written)
}
