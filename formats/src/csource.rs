//! C-source emission: the converted data as `const` arrays with a small
//! banner comment, ready for inclusion in a homebrew build.

use std::fmt::Write as _;
use std::path::Path;

use engine::bg::BgOutput;
use engine::texture::{Texture, TextureFormat};

use crate::{Result, write_file};

/// Turn a file stem into a C identifier.
fn identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn banner(out: &mut String, name: &str, format: &str, colors: usize) {
    let _ = writeln!(out, "///////////////////////////////////////");
    let _ = writeln!(out, "//");
    let _ = writeln!(out, "// {name}");
    let _ = writeln!(out, "// Format: {format}");
    let _ = writeln!(out, "// Colors: {colors}");
    let _ = writeln!(out, "//");
    let _ = writeln!(out, "///////////////////////////////////////");
    let _ = writeln!(out);
}

fn byte_array(out: &mut String, name: &str, data: &[u8]) {
    let _ = writeln!(out, "const unsigned char {name}[] = {{");
    for row in data.chunks(8) {
        let line: Vec<String> = row.iter().map(|b| format!("0x{b:02X}")).collect();
        let _ = writeln!(out, "    {},", line.join(", "));
    }
    let _ = writeln!(out, "}};");
    let _ = writeln!(out);
}

fn halfword_array(out: &mut String, name: &str, data: &[u16]) {
    let _ = writeln!(out, "const unsigned short {name}[] = {{");
    for row in data.chunks(8) {
        let line: Vec<String> = row.iter().map(|w| format!("0x{w:04X}")).collect();
        let _ = writeln!(out, "    {},", line.join(", "));
    }
    let _ = writeln!(out, "}};");
    let _ = writeln!(out);
}

fn halfwords(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Write a background conversion as one C source file at `path`.
///
/// # Errors
///
/// I/O failure while writing `path`.
pub fn write_bg(path: &Path, name: &str, bg: &BgOutput) -> Result<()> {
    let ident = identifier(name);
    let mut out = String::new();
    let format = if bg.screen_unit_bits == 0 {
        "bitmap".to_string()
    } else {
        format!("{}bpp", bg.depth)
    };
    banner(&mut out, name, &format, bg.palette.len());

    let palette: Vec<u16> = bg.palette.iter().map(|c| c.0).collect();
    halfword_array(&mut out, &format!("{ident}_pal"), &palette);
    byte_array(&mut out, &format!("{ident}_chr"), &bg.chars);
    if !bg.screen.is_empty() {
        if bg.screen_unit_bits == 16 {
            halfword_array(&mut out, &format!("{ident}_scr"), &halfwords(&bg.screen));
        } else {
            byte_array(&mut out, &format!("{ident}_scr"), &bg.screen);
        }
    }
    write_file(path, out.as_bytes())
}

/// Write a texture conversion as one C source file at `path`.
///
/// # Errors
///
/// I/O failure while writing `path`.
pub fn write_texture(path: &Path, name: &str, texture: &Texture) -> Result<()> {
    let ident = identifier(name);
    let format = texture.params.format();
    let mut out = String::new();
    banner(&mut out, name, format.name(), texture.palette.len());

    let _ = writeln!(
        &mut out,
        "const unsigned int {ident}_texImageParam = 0x{:08X};",
        texture.params.0
    );
    let _ = writeln!(&mut out);
    byte_array(&mut out, &format!("{ident}_tex"), &texture.texel);
    if format == TextureFormat::Tex4x4 {
        halfword_array(&mut out, &format!("{ident}_idx"), &halfwords(&texture.index));
    }
    if format.requires_palette() {
        let palette: Vec<u16> = texture.palette.iter().map(|c| c.0).collect();
        halfword_array(&mut out, &format!("{ident}_pal"), &palette);
    }
    write_file(path, out.as_bytes())
}
