//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use streamdl_core::download::constants::{SUBTITLE_MINIMUM_SIZE, VIDEO_MINIMUM_SIZE};

/// Download a progressive file or HLS stream over parallel connections.
///
/// Every URL is a mirror of the same content; later mirrors are tried when
/// earlier ones fail.
#[derive(Parser, Debug)]
#[command(name = "streamdl")]
#[command(author, version, about)]
pub struct Args {
    /// Mirror URLs of one download, in preference order
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Directory the output file is written to
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Output file name (defaults to the last URL path segment)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Stable download id for checkpoints (defaults to the output name)
    #[arg(long)]
    pub id: Option<String>,

    /// Treat the URLs as HLS playlists even without a .m3u8 suffix
    #[arg(long)]
    pub hls: bool,

    /// Parallel connections per download (1-16)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub connections: Option<u8>,

    /// Maximum attempts per chunk for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Referer header sent with every request
    #[arg(long)]
    pub referer: Option<String>,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Continue from a partial file and stored checkpoint
    #[arg(long)]
    pub resume: bool,

    /// Reject downloads smaller than this: bytes, "video" or "subtitle"
    #[arg(long, value_parser = parse_min_size)]
    pub min_size: Option<u64>,

    /// SQLite database for resume checkpoints
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Print progress as JSON lines instead of a progress bar
    #[arg(long)]
    pub json_progress: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_min_size(raw: &str) -> Result<u64, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "video" => Ok(VIDEO_MINIMUM_SIZE),
        "subtitle" => Ok(SUBTITLE_MINIMUM_SIZE),
        other => other
            .parse::<u64>()
            .map_err(|_| format!("expected a byte count, 'video' or 'subtitle', got '{raw}'")),
    }
}
