//! Command-line argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Get default config path help text for current platform
fn default_config_help() -> String {
    #[cfg(target_os = "linux")]
    return "Config file path (default: ~/.config/glamour/config.json)".to_string();

    #[cfg(target_os = "macos")]
    return "Config file path (default: ~/Library/Application Support/glamour/config.json)"
        .to_string();

    #[cfg(target_os = "windows")]
    return "Config file path (default: %APPDATA%\\glamour\\config.json)".to_string();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return "Config file path (overrides platform default)".to_string();
}

/// Glamour cache maintenance tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path (overrides platform default)
    #[arg(short, long, help = default_config_help())]
    pub config: Option<PathBuf>,

    /// Cache root directory (overrides the config file)
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List cached objects
    Ls,

    /// Show entry count and total size
    Stats,

    /// Re-hash every cached object and report corruption
    Verify,

    /// Run one hardlink compaction pass
    Compact {
        /// Extra directory to include (repeatable)
        #[arg(short, long = "dir")]
        dirs: Vec<PathBuf>,
    },
}
