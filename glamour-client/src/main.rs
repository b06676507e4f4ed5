//! Glamour cache maintenance tool

mod args;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use args::{Args, Command};
use glamour_client::{ContentCache, FileCompactor, SyncConfig};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

/// Log to stderr; `RUST_LOG` overrides the level chosen by `--debug`
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match args.config.clone().or_else(SyncConfig::default_path) {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            SyncConfig::load(&path)?
        }
        None => SyncConfig::default(),
    };
    let cache_dir: PathBuf = args
        .cache_dir
        .clone()
        .or_else(|| config.resolved_cache_dir())
        .ok_or("cannot determine cache directory; pass --cache-dir")?;
    let cache = Arc::new(ContentCache::open(cache_dir)?);

    match args.command {
        Command::Ls => {
            for entry in cache.enumerate() {
                let entry = entry?;
                println!(
                    "{}  {:>12}  {}",
                    entry.hash,
                    entry.size_bytes,
                    entry.last_access.to_rfc3339()
                );
            }
        }
        Command::Stats => {
            let stats = cache.stats()?;
            println!("root:    {}", cache.root().display());
            println!("entries: {}", stats.entries);
            println!("bytes:   {}", stats.total_bytes);
        }
        Command::Verify => {
            let report = cache.verify().await?;
            println!("checked:   {}", report.checked);
            println!("corrupted: {}", report.corrupted.len());
            for hash in &report.corrupted {
                println!("  {hash}");
            }
            if !report.corrupted.is_empty() {
                return Err(format!("{} corrupted objects", report.corrupted.len()).into());
            }
        }
        Command::Compact { dirs } => {
            let mut settings = config.compactor.clone();
            settings.extra_dirs.extend(dirs);
            let report = FileCompactor::new(cache, settings, None).run_once().await?;
            println!("scanned:   {}", report.scanned_files);
            println!("groups:    {}", report.duplicate_groups);
            println!("linked:    {}", report.linked);
            println!("reclaimed: {} bytes", report.bytes_reclaimed);
            println!("skipped:   {}", report.skipped);
        }
    }
    Ok(())
}
