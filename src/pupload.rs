use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use parallel_upload::config::{Config, parse_size};
use parallel_upload::s3::S3Client;
use parallel_upload::{ObjectMetadata, ParallelUploader};

#[derive(Parser, Debug)]
#[command(
    name = "pupload",
    version = env!("CARGO_PKG_VERSION"),
    author = "Tyr Chen <tyr.chen@gmail.com>",
    about = "Upload a large file to AWS S3 as parallel shards composed into one object",
    long_about = "Splits a file into byte ranges, uploads each range to a temporary object in parallel, \
                  then composes the temporary objects server side into the destination and deletes them. \
                  Configure via .env file with AWS credentials.",
    after_help = "Examples:\n  \
                  pupload ./video.mp4                          # Upload with default tuning\n  \
                  pupload ./video.mp4 -s 16                    # Use up to 16 parallel streams\n  \
                  pupload ./backup.tar --key backups/today.tar # Choose the object key\n  \
                  pupload ./video.mp4 --json                   # Print the result as JSON\n\n\
                  Configuration (.env):\n  \
                  AWS_REGION=us-west-2\n  \
                  S3_BUCKET=my-bucket\n  \
                  S3_TARGET_PATH=uploads\n  \
                  PUPLOAD_MAX_STREAMS=8\n  \
                  PUPLOAD_MIN_STREAM_SIZE=64M\n\n\
                  For more information: https://github.com/tyrchen/swiss-knife"
)]
struct Cli {
    /// File to upload
    path: PathBuf,

    /// Object key, relative to S3_TARGET_PATH (default: the file name)
    #[arg(long)]
    key: Option<String>,

    /// Maximum number of parallel streams (overrides PUPLOAD_MAX_STREAMS)
    #[arg(long, short = 's')]
    max_streams: Option<usize>,

    /// Minimum size of each stream, e.g. 64M (overrides PUPLOAD_MIN_STREAM_SIZE)
    #[arg(long, value_parser = parse_size)]
    min_stream_size: Option<u64>,

    /// Size of each read from the file, e.g. 8M (overrides PUPLOAD_BUFFER_SIZE)
    #[arg(long, value_parser = parse_size)]
    buffer_size: Option<u64>,

    /// Content-Type of the uploaded object
    #[arg(long)]
    content_type: Option<String>,

    /// Succeed even if temporary shard objects could not be deleted
    #[arg(long)]
    ignore_cleanup_failures: bool,

    /// Print the uploaded object as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    object: &'a ObjectMetadata,
    elapsed_secs: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("Parallel Upload Tool v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(max_streams) = cli.max_streams {
        config.max_streams = max_streams;
    }
    if let Some(min_stream_size) = cli.min_stream_size {
        config.min_stream_size = min_stream_size;
    }
    if let Some(buffer_size) = cli.buffer_size {
        config.buffer_size = usize::try_from(buffer_size).context("Buffer size is too large")?;
    }
    config.validate_tuning()?;

    let file_name = match &cli.key {
        Some(key) => key.clone(),
        None => cli
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", cli.path.display()))?,
    };
    let key = config.build_s3_key(&file_name);

    let mut options = config.upload_options();
    options.ignore_cleanup_failures = cli.ignore_cleanup_failures;
    info!(
        "Max streams: {}, min stream size: {}, buffer size: {}",
        options.max_streams,
        format_size(options.min_stream_size),
        format_size(options.buffer_size as u64)
    );

    let s3_client = S3Client::new(config.clone()).await?;
    let mut request = s3_client.request(&key);
    if let Some(content_type) = &cli.content_type {
        request = request.with_content_type(content_type);
    }

    let pb = if cli.json {
        ProgressBar::hidden()
    } else {
        println!(
            "{}",
            style(format!("📦 Target: s3://{}/{}", s3_client.bucket(), key))
                .cyan()
                .bold()
        );
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
                )?
                .progress_chars("#>-"),
        );
        pb.set_message(file_name.clone());
        pb
    };

    let uploader = ParallelUploader::new(Arc::new(s3_client), options).with_progress(pb.clone());
    let start_time = Instant::now();
    let result = uploader.upload_file(&cli.path, &request).await;
    pb.finish_and_clear();

    let object = match result {
        Ok(object) => object,
        Err(e) => {
            eprintln!("{} {}", style("✗").red(), style(&file_name).red());
            eprintln!("{}", e.user_message());
            std::process::exit(1);
        }
    };
    let elapsed = start_time.elapsed();

    if cli.json {
        let report = Report {
            object: &object,
            elapsed_secs: elapsed.as_secs_f64(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_summary(&object, elapsed.as_secs_f64());
    Ok(())
}

fn print_summary(object: &ObjectMetadata, elapsed_secs: f64) {
    println!(
        "{} {}",
        style("✓").green(),
        style(format!("s3://{}/{}", object.bucket, object.name)).green()
    );
    println!("\n{}", style("═".repeat(70)).dim());
    println!(
        "{}",
        style(format!(
            "Uploaded: {} ({} bytes)",
            format_size(object.size),
            object.size
        ))
        .bold()
    );

    if let Some(etag) = &object.etag {
        println!("{}", style(format!("ETag: {}", etag)).dim());
    }
    if let Some(version) = &object.generation {
        println!("{}", style(format!("Version: {}", version)).dim());
    }

    if elapsed_secs > 0.0 {
        let speed = object.size as f64 / elapsed_secs / 1024.0 / 1024.0;
        println!(
            "{}",
            style(format!(
                "Time: {:.2}s, Average speed: {:.2} MB/s",
                elapsed_secs, speed
            ))
            .dim()
        );
    }
}

/// Format file size for display
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
