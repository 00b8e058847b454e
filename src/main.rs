//! mandarin - DS background and texture converter.
//!
//! Thin command-line front end: parses options, decodes the input image,
//! hands it to the `engine` crate and serializes the result through the
//! `formats` crate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use engine::bg::{BgParams, BgProfile};
use engine::color::Rgba;
use engine::progress::Progress;
use engine::raster::Raster;
use engine::reduction::Reduction;
use engine::texture::{ConvertParams, TextureFormat};
use formats::compression::CompressionPolicy;

#[derive(Parser)]
#[command(name = "mandarin", version, about = "DS background and texture converter")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Convert an image to BG palette, character and screen data
    Bg(BgArgs),
    /// Convert an image to texture data
    Tex(TexArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Input image (png, bmp, jpeg, tga)
    input: PathBuf,

    /// Output base name; defaults to the input path without extension
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output container
    #[arg(long, value_enum, default_value = "binary")]
    container: Container,

    /// Dithering strength in percent
    #[arg(short, long, default_value_t = 0)]
    dither: u32,

    /// Alpha key as a 24-bit RRGGBB hex color
    #[arg(short = 'k', long)]
    alpha_key: Option<String>,

    /// Lightness-color balance [1, 39]
    #[arg(long, default_value_t = 20)]
    balance: i32,

    /// Red-green color balance [1, 39]
    #[arg(long, default_value_t = 20)]
    color_balance: i32,

    /// Enhance colors in gradients
    #[arg(long)]
    enhance_colors: bool,
}

#[derive(Args)]
struct BgArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Background profile
    #[arg(long, value_enum, default_value = "text16")]
    profile: ProfileArg,

    /// Number of palettes in the output
    #[arg(short = 'p', long, default_value_t = 1)]
    palettes: usize,

    /// First palette index
    #[arg(long, default_value_t = 0)]
    palette_base: usize,

    /// First color slot used within each palette
    #[arg(long, default_value_t = 0)]
    palette_offset: usize,

    /// Colors per palette; defaults to the profile's depth
    #[arg(long)]
    palette_size: Option<usize>,

    /// Compress characters to at most this many
    #[arg(long)]
    max_chars: Option<usize>,

    /// First character index
    #[arg(long, default_value_t = 0)]
    char_base: usize,

    /// Disable character compression
    #[arg(long)]
    no_merge: bool,

    /// Disable tile flipping
    #[arg(long)]
    no_flip: bool,
}

#[derive(Args)]
struct TexArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Texture format
    #[arg(short, long, value_enum, default_value = "palette256")]
    format: FormatArg,

    /// Limit palette colors regardless of format capacity
    #[arg(long, default_value_t = 0)]
    colors: usize,

    /// Reserve palette color 0 as transparent
    #[arg(long)]
    color0_transparent: bool,

    /// Diffuse the quantized alpha of a3i5/a5i3 textures
    #[arg(long)]
    dither_alpha: bool,

    /// 4x4 palette compression strength [0, 100]
    #[arg(long, default_value_t = 0)]
    threshold: u32,

    /// Trim texel rows past the source height
    #[arg(long)]
    trim: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Container {
    /// Raw binary files per component
    Binary,
    /// A single C source file
    C,
    /// The GRF block container
    Grf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProfileArg {
    /// Text BG, 4bpp, 16 palettes
    #[value(name = "text16")]
    Text16,
    /// Text BG, 8bpp, one palette
    #[value(name = "text256")]
    Text256,
    /// Affine BG, 8bpp, byte screen entries
    #[value(name = "affine")]
    Affine,
    /// Affine-extended BG, 8bpp, 16 palettes
    #[value(name = "affine-ext")]
    AffineExt,
    /// Bitmap BG, 8bpp pixel array
    #[value(name = "bitmap")]
    Bitmap,
}

impl From<ProfileArg> for BgProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Text16 => Self::Text16x16,
            ProfileArg::Text256 => Self::Text256x1,
            ProfileArg::Affine => Self::Affine256x1,
            ProfileArg::AffineExt => Self::AffineExt256x16,
            ProfileArg::Bitmap => Self::Bitmap,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    #[value(name = "a3i5")]
    A3I5,
    #[value(name = "palette4")]
    Palette4,
    #[value(name = "palette16")]
    Palette16,
    #[value(name = "palette256")]
    Palette256,
    #[value(name = "tex4x4")]
    Tex4x4,
    #[value(name = "a5i3")]
    A5I3,
    #[value(name = "direct")]
    Direct,
}

impl From<FormatArg> for TextureFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::A3I5 => Self::A3I5,
            FormatArg::Palette4 => Self::Palette4,
            FormatArg::Palette16 => Self::Palette16,
            FormatArg::Palette256 => Self::Palette256,
            FormatArg::Tex4x4 => Self::Tex4x4,
            FormatArg::A5I3 => Self::A5I3,
            FormatArg::Direct => Self::Direct,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(cli) {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Bg(args) => run_bg(&args),
        Command::Tex(args) => run_tex(&args),
    }
}

fn load_image(path: &Path) -> Result<Raster> {
    let img = image::open(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .to_rgba8();
    let (width, height) = img.dimensions();
    let pixels = img
        .as_raw()
        .chunks_exact(4)
        .map(|c| Rgba::new(c[0], c[1], c[2], c[3]))
        .collect();
    Ok(Raster::new(width as usize, height as usize, pixels))
}

fn parse_hex_color(text: &str) -> Result<Rgba> {
    let hex = text.trim_start_matches('#');
    if hex.len() != 6 {
        bail!("alpha key must be a 6-digit RRGGBB hex color, got {text:?}");
    }
    let value = u32::from_str_radix(hex, 16)
        .with_context(|| format!("alpha key {text:?} is not valid hex"))?;
    Ok(Rgba::new(
        (value >> 16) as u8,
        (value >> 8) as u8,
        value as u8,
        0xFF,
    ))
}

fn output_base(common: &CommonArgs) -> PathBuf {
    common
        .output
        .clone()
        .unwrap_or_else(|| common.input.with_extension(""))
}

fn output_name(base: &Path) -> String {
    base.file_stem()
        .map_or_else(|| "converted".to_string(), |s| s.to_string_lossy().into_owned())
}

fn reduction_for(common: &CommonArgs) -> Reduction {
    Reduction::new(common.balance, common.color_balance, common.enhance_colors)
}

fn run_bg(args: &BgArgs) -> Result<()> {
    let common = &args.common;
    let raster = load_image(&common.input)?;
    let rd = reduction_for(common);
    let profile: BgProfile = args.profile.into();

    let mut params = BgParams::new(profile);
    params.n_palettes = args.palettes;
    params.palette_base = args.palette_base;
    params.palette_offset = args.palette_offset;
    params.palette_length = args
        .palette_size
        .unwrap_or_else(|| (1usize << profile.depth()).saturating_sub(args.palette_offset));
    if let Some(max) = args.max_chars {
        params.max_chars = max;
    }
    params.char_base = args.char_base;
    params.merge = !args.no_merge;
    params.flip = profile.allows_flip() && !args.no_flip;
    params.dither = common.dither > 0;
    params.diffuse = f64::from(common.dither.min(100)) / 100.0;
    if let Some(key) = &common.alpha_key {
        params.alpha_key = Some(parse_hex_color(key)?);
    }

    let progress = Progress::default();
    let out = engine::bg::convert(&rd, &raster, &params, &progress)?;
    tracing::info!(
        chars = out.n_chars,
        palette_colors = out.palette.len(),
        screen_bytes = out.screen.len(),
        "converted background"
    );

    let base = output_base(common);
    match common.container {
        Container::Binary => {
            for path in formats::binary::write_bg(&base, &out)? {
                tracing::info!("wrote {}", path.display());
            }
        }
        Container::C => {
            let path = base.with_extension("h");
            formats::csource::write_bg(&path, &output_name(&base), &out)?;
            tracing::info!("wrote {}", path.display());
        }
        Container::Grf => {
            let path = base.with_extension("grf");
            formats::grf::write_bg(&path, &out, CompressionPolicy::default())?;
            tracing::info!("wrote {}", path.display());
        }
    }
    Ok(())
}

fn run_tex(args: &TexArgs) -> Result<()> {
    let common = &args.common;
    let raster = load_image(&common.input)?;
    let rd = reduction_for(common);

    let mut params = ConvertParams::new(args.format.into());
    params.dither = common.dither > 0;
    params.diffuse = f64::from(common.dither.min(100)) / 100.0;
    params.dither_alpha = args.dither_alpha;
    params.color_entries = args.colors;
    params.color0_transparent = args.color0_transparent;
    params.threshold = args.threshold.min(100);
    params.trim = args.trim;

    let progress = Progress::default();
    let out = engine::texture::convert(&rd, &raster, &params, &progress)?;
    tracing::info!(
        format = out.params.format().name(),
        texel_bytes = out.texel.len(),
        index_bytes = out.index.len(),
        palette_colors = out.palette.len(),
        vram_bytes = out.texel_vram_size() + out.index_vram_size() + out.palette_vram_size(),
        "converted texture"
    );

    let base = output_base(common);
    match common.container {
        Container::Binary => {
            for path in formats::binary::write_texture(&base, &out)? {
                tracing::info!("wrote {}", path.display());
            }
        }
        Container::C => {
            let path = base.with_extension("h");
            formats::csource::write_texture(&path, &output_name(&base), &out)?;
            tracing::info!("wrote {}", path.display());
        }
        Container::Grf => {
            let path = base.with_extension("grf");
            formats::grf::write_texture(&path, &out, CompressionPolicy::default())?;
            tracing::info!("wrote {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hex_colors_parse() {
        assert_eq!(
            parse_hex_color("FF00FF").unwrap(),
            Rgba::new(255, 0, 255, 255)
        );
        assert_eq!(
            parse_hex_color("#102030").unwrap(),
            Rgba::new(0x10, 0x20, 0x30, 255)
        );
        assert!(parse_hex_color("12345").is_err());
        assert!(parse_hex_color("GGGGGG").is_err());
    }

    #[test]
    fn cli_parses_bg_subcommand() {
        let cli = Cli::try_parse_from([
            "mandarin", "bg", "input.png", "-p", "4", "--profile", "text16", "--dither", "50",
        ])
        .unwrap();
        match cli.command {
            Command::Bg(args) => {
                assert_eq!(args.palettes, 4);
                assert_eq!(args.common.dither, 50);
            }
            Command::Tex(_) => panic!("expected bg"),
        }
    }

    #[test]
    fn cli_parses_tex_subcommand() {
        let cli = Cli::try_parse_from([
            "mandarin",
            "tex",
            "input.png",
            "--format",
            "tex4x4",
            "--threshold",
            "25",
        ])
        .unwrap();
        match cli.command {
            Command::Tex(args) => {
                assert!(matches!(args.format, FormatArg::Tex4x4));
                assert_eq!(args.threshold, 25);
            }
            Command::Bg(_) => panic!("expected tex"),
        }
    }
}
