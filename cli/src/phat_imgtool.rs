//! # phat_imgtool
//!
//! Offline companion to `server_phat`. Converts an image to the display's
//! black/white/red palette exactly as the server does on upload, or reports
//! whether a file would be accepted.

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use lib_common::core::image_store::fingerprint;
use lib_common::core::{DISPLAY_HEIGHT, DISPLAY_WIDTH, ImageCodec, PHAT_PALETTE, PhatCodec};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "phat_imgtool",
    version = "1.0.0",
    author = "ckir",
    about = "Prepares images for phat e-ink displays."
)]
pub struct Cli {
    /// Enable verbose logging.
    #[clap(long, short = 'v', global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Convert an appropriately-sized image to the display palette.
    Convert {
        /// Image to convert (PNG, JPEG or GIF).
        #[clap(value_hint = ValueHint::FilePath)]
        input: PathBuf,

        /// Where to write the indexed PNG.
        #[clap(long, short = 'o', value_hint = ValueHint::FilePath, default_value = "out.png")]
        output: PathBuf,

        /// Convert even if the image is not 212x104.
        #[clap(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Print format, size and fingerprint, and whether the server would accept it.
    Inspect {
        #[clap(value_hint = ValueHint::FilePath)]
        input: PathBuf,
    },
}

/// What `inspect` prints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    pub path: String,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub fits_display: bool,
    pub fingerprint: String,
}

pub fn inspect(codec: &dyn ImageCodec, input: &Path) -> Result<Inspection> {
    let raw = fs::read(input).with_context(|| format!("unable to open {}", input.display()))?;
    let header = codec.decode_dimensions(&raw)?;
    Ok(Inspection {
        path: input.display().to_string(),
        content_type: header.mime_type().to_string(),
        width: header.width,
        height: header.height,
        fits_display: header.matches_display(),
        fingerprint: fingerprint(&raw),
    })
}

/// Writes the palette-converted image to `output` and returns its fingerprint.
pub fn convert(codec: &dyn ImageCodec, input: &Path, output: &Path, force: bool) -> Result<String> {
    let raw = fs::read(input).with_context(|| format!("unable to open {}", input.display()))?;
    let header = codec.decode_dimensions(&raw)?;
    if !header.matches_display() {
        if !force {
            bail!(
                "{} is {}x{}, the display needs {}x{} (use --force to convert anyway)",
                input.display(),
                header.width,
                header.height,
                DISPLAY_WIDTH,
                DISPLAY_HEIGHT
            );
        }
        tracing::warn!(width = header.width, height = header.height, "converting an image that will not fit the display");
    }

    let pixels = codec.decode_full(&raw)?;
    let converted = codec.encode_paletted(&pixels, &PHAT_PALETTE)?;
    fs::write(output, &converted).with_context(|| format!("unable to write {}", output.display()))?;
    tracing::debug!(input = %input.display(), output = %output.display(), size = converted.len(), "converted image");
    Ok(fingerprint(&converted))
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let codec = PhatCodec;
    match args.command {
        Command::Convert { input, output, force } => {
            let hash = convert(&codec, &input, &output, force)?;
            println!("{} -> {} ({})", input.display(), output.display(), hash);
        }
        Command::Inspect { input } => {
            let report = inspect(&codec, &input)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
