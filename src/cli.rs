//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use url::Url;

/// Fetch and send files over HTTP.
///
/// Downloads are split into concurrent byte-range blocks when the server
/// supports it and the file is large enough; otherwise they are streamed.
#[derive(Parser, Debug)]
#[command(name = "funget")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// JSON config file (FUNGET_* environment variables are applied on top)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a URL to a local file
    Download(DownloadArgs),
    /// Upload a local file to a URL
    Upload(UploadArgs),
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// URL to download
    pub url: String,

    /// Destination file (defaults to the last path segment of the URL)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Number of block workers
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..=1000))]
    pub workers: Option<u16>,

    /// Block size in MiB
    #[arg(short, long, value_name = "MIB", value_parser = clap::value_parser!(u64).range(1..))]
    pub block_size: Option<u64>,

    /// Attempts per block or stream
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(short, long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Extra request header, e.g. -H 'Authorization: Bearer x' (repeatable)
    #[arg(short = 'H', long = "header", value_name = "K: V", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Replace the destination if it exists
    #[arg(long)]
    pub overwrite: bool,

    /// Fail instead of creating missing parent directories
    #[arg(long)]
    pub no_create_dirs: bool,

    /// Always use a single stream
    #[arg(long, conflicts_with = "multi")]
    pub single: bool,

    /// Use blocks whenever the server supports ranges, whatever the size
    #[arg(long)]
    pub multi: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(ClapArgs, Debug)]
pub struct UploadArgs {
    /// File to upload
    pub path: PathBuf,

    /// Target URL
    pub url: String,

    /// HTTP method (PUT or POST)
    #[arg(short = 'X', long, value_name = "METHOD")]
    pub method: Option<String>,

    /// Attempts per upload
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub max_retries: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(short, long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Body read size in bytes
    #[arg(long, value_name = "BYTES", value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: Option<u64>,

    /// Extra request header, e.g. -H 'Content-Type: application/zip' (repeatable)
    #[arg(short = 'H', long = "header", value_name = "K: V", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Parses `Name: value` into a header pair.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// File name implied by a URL: its last non-empty path segment, percent-decoded.
pub fn default_file_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(std::borrow::Cow::into_owned)
                .unwrap_or(segment)
        })
        .map(|name| sanitize_file_name(&name))
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| "download".to_string())
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
