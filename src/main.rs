//! CLI entry point for funget.

use std::io::IsTerminal;
use std::path::PathBuf;
use anyhow::{Context, Result, bail};
use clap::Parser;
use funget::download::{Mode, TransferDescriptor};
use funget::upload::upload_with;
use funget::{Downloader, FungetConfig, HttpClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cli;
mod progress_ui;

use cli::{Args, Command, DownloadArgs, UploadArgs, default_file_name};
use progress_ui::ProgressUi;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let config = load_config(&args)?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config log_level
    let default_level = if args.quiet {
        "error".to_string()
    } else {
        match args.verbose {
            0 => config.log_level.to_ascii_lowercase(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let show_progress = config.progress_bar && !args.quiet && std::io::stderr().is_terminal();

    match args.command {
        Command::Download(download) => run_download(download, &config, show_progress, cancel).await,
        Command::Upload(upload) => run_upload(upload, &config, show_progress, cancel).await,
    }
}

fn load_config(args: &Args) -> Result<FungetConfig> {
    let mut config = match &args.config {
        Some(path) => FungetConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FungetConfig::default(),
    };
    config
        .apply_env(|name| std::env::var(name).ok())
        .context("invalid FUNGET_* environment variable")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling transfer");
            cancel.cancel();
        }
    });
}

async fn run_download(
    args: DownloadArgs,
    config: &FungetConfig,
    show_progress: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut settings = config.download.clone();
    if let Some(workers) = args.workers {
        settings.worker_num = usize::from(workers);
    }
    if let Some(block_size) = args.block_size {
        settings.block_size = block_size;
    }
    if let Some(max_retries) = args.max_retries {
        settings.max_retries = max_retries;
    }
    if let Some(timeout) = args.timeout {
        settings.timeout = timeout;
    }
    settings.overwrite |= args.overwrite;
    if args.no_create_dirs {
        settings.create_dirs = false;
    }
    settings.headers.extend(args.headers);

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(default_file_name(&args.url)));
    let descriptor = TransferDescriptor::new(&args.url, &output, &settings.to_transfer_options())?;

    let mode = if args.single {
        Mode::SingleStream
    } else if args.multi {
        Mode::MultiBlock
    } else {
        Mode::Auto
    };

    let ui = ProgressUi::new(show_progress && !args.no_progress, &descriptor.file_name());
    let downloader = Downloader::new(HttpClient::new())
        .with_observer(ui.observer())
        .with_cancel_token(cancel);

    info!(url = %descriptor.url(), path = %output.display(), "starting download");
    let result = downloader.download_with(&descriptor, mode).await;
    ui.finish();
    let report = result?;

    info!(
        path = %report.path.display(),
        bytes = report.bytes,
        strategy = ?report.strategy,
        blocks = report.blocks,
        retries = report.retries,
        "download complete"
    );
    Ok(())
}

async fn run_upload(
    args: UploadArgs,
    config: &FungetConfig,
    show_progress: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut settings = config.upload.clone();
    if let Some(method) = &args.method {
        settings.method = method.parse()?;
    }
    if let Some(max_retries) = args.max_retries {
        settings.max_retries = max_retries;
    }
    if let Some(timeout) = args.timeout {
        settings.timeout = timeout;
    }
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size =
            usize::try_from(chunk_size).context("chunk size does not fit in memory")?;
    }
    settings.headers.extend(args.headers);

    let label = args
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ui = ProgressUi::new(show_progress && !args.no_progress, &label);

    info!(url = %args.url, path = %args.path.display(), method = %settings.method, "starting upload");
    let options = settings.to_upload_options();
    let client = HttpClient::new();
    let transfer = upload_with(&client, &args.url, &args.path, &options, Some(ui.observer()));
    let result = tokio::select! {
        result = transfer => result,
        () = cancel.cancelled() => {
            ui.finish();
            bail!("upload cancelled");
        }
    };
    ui.finish();
    let report = result?;

    info!(
        url = %report.url,
        bytes = report.bytes,
        status = report.status,
        attempts = report.attempts,
        "upload complete"
    );
    Ok(())
}
