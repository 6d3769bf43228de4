use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use hotcopy::{BitmapSyncPolicy, OnError, SyncMode, BACKUP_CLUSTER_SIZE_DEFAULT};

#[derive(Debug, Parser)]
#[command(name = "hotcopy", version, about = "Point-in-time backup of raw disk images.")]
pub struct Cli {
    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `HOTCOPY_LOG`.
    #[arg(long, global = true, env = "HOTCOPY_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy SOURCE to TARGET.
    Backup(BackupArgs),
    /// Create and inspect persisted dirty bitmaps.
    #[command(subcommand)]
    Bitmap(BitmapCommand),
}

#[derive(Debug, Args)]
pub struct BackupArgs {
    /// Raw source image.
    pub source: PathBuf,

    /// Raw target image; created with the source's length.
    pub target: PathBuf,

    /// Which clusters to copy.
    ///
    /// Environment variable: `HOTCOPY_SYNC`.
    #[arg(long, value_enum, default_value_t = CliSyncMode::Full, env = "HOTCOPY_SYNC")]
    pub sync: CliSyncMode,

    /// Throughput limit in bytes per second (0 = unlimited).
    ///
    /// Environment variable: `HOTCOPY_SPEED`.
    #[arg(long, value_name = "BYTES", default_value_t = 0, env = "HOTCOPY_SPEED")]
    pub speed: u64,

    /// Persisted dirty bitmap (JSON) used by `--sync bitmap` and updated after the job.
    ///
    /// Environment variable: `HOTCOPY_BITMAP`.
    #[arg(long, value_name = "FILE", env = "HOTCOPY_BITMAP")]
    pub bitmap: Option<PathBuf>,

    /// When the bitmap is cleared of the clusters this backup copied.
    ///
    /// Environment variable: `HOTCOPY_BITMAP_MODE`.
    #[arg(long, value_enum, default_value_t = CliBitmapMode::OnSuccess, env = "HOTCOPY_BITMAP_MODE")]
    pub bitmap_mode: CliBitmapMode,

    /// Reaction to read errors on the source.
    ///
    /// Environment variable: `HOTCOPY_ON_SOURCE_ERROR`.
    #[arg(long, value_enum, default_value_t = CliOnError::Report, env = "HOTCOPY_ON_SOURCE_ERROR")]
    pub on_source_error: CliOnError,

    /// Reaction to write errors on the target.
    ///
    /// Environment variable: `HOTCOPY_ON_TARGET_ERROR`.
    #[arg(long, value_enum, default_value_t = CliOnError::Report, env = "HOTCOPY_ON_TARGET_ERROR")]
    pub on_target_error: CliOnError,

    /// Overwrite an existing target.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,

    /// Suppress progress output.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum BitmapCommand {
    /// Write an empty bitmap.
    Create {
        file: PathBuf,

        /// Size of the tracked device in bytes.
        #[arg(long, value_name = "BYTES")]
        size: u64,

        /// Bytes per bit (power of two).
        #[arg(long, value_name = "BYTES", default_value_t = BACKUP_CLUSTER_SIZE_DEFAULT)]
        granularity: u64,

        #[arg(long, action = clap::ArgAction::SetTrue)]
        force: bool,
    },
    /// Mark a byte range dirty.
    Mark {
        file: PathBuf,

        #[arg(long, value_name = "BYTES")]
        offset: u64,

        #[arg(long, value_name = "BYTES")]
        length: u64,
    },
    /// Print a summary of the bitmap as JSON.
    Show { file: PathBuf },
}

/// `none` is not offered: without a running guest there are no writes to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliSyncMode {
    Full,
    Top,
    Bitmap,
}

impl From<CliSyncMode> for SyncMode {
    fn from(value: CliSyncMode) -> Self {
        match value {
            CliSyncMode::Full => SyncMode::Full,
            CliSyncMode::Top => SyncMode::Top,
            CliSyncMode::Bitmap => SyncMode::Bitmap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliBitmapMode {
    Always,
    Never,
    OnSuccess,
}

impl From<CliBitmapMode> for BitmapSyncPolicy {
    fn from(value: CliBitmapMode) -> Self {
        match value {
            CliBitmapMode::Always => BitmapSyncPolicy::Always,
            CliBitmapMode::Never => BitmapSyncPolicy::Never,
            CliBitmapMode::OnSuccess => BitmapSyncPolicy::OnSuccess,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliOnError {
    Report,
    Ignore,
    Enospc,
    Stop,
}

impl From<CliOnError> for OnError {
    fn from(value: CliOnError) -> Self {
        match value {
            CliOnError::Report => OnError::Report,
            CliOnError::Ignore => OnError::Ignore,
            CliOnError::Enospc => OnError::Enospc,
            CliOnError::Stop => OnError::Stop,
        }
    }
}

impl Cli {
    /// Filter for the tracing subscriber: `--log-level`, then `RUST_LOG`, then `info`.
    pub fn log_filter(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string())
    }
}
