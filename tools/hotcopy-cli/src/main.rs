use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hotcopy::{
    BackupJob, BackupOptions, BlockDevice, ClusterBitmap, DirtyBitmap, FileVolume, JobOutcome,
    SyncMode,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;

use config::{BackupArgs, BitmapCommand, Cli, Command};

const PROGRESS_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize)]
struct BitmapSummary {
    size: u64,
    granularity: u64,
    dirty_bytes: u64,
    dirty_clusters: u64,
    ranges: Vec<[u64; 2]>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(cli.log_filter()).context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Backup(args) => backup(args).await,
        Command::Bitmap(cmd) => bitmap(cmd),
    }
}

async fn backup(args: BackupArgs) -> Result<()> {
    let sync_mode = SyncMode::from(args.sync);
    if sync_mode == SyncMode::Bitmap && args.bitmap.is_none() {
        bail!("--sync bitmap requires --bitmap FILE");
    }
    if args.target.exists() && !args.force {
        bail!(
            "refusing to overwrite {} (use --force to override)",
            args.target.display()
        );
    }

    let source = Arc::new(
        FileVolume::open(&args.source)
            .await
            .with_context(|| format!("open source {}", args.source.display()))?,
    );
    let len = source
        .length()
        .await
        .context("query source length")?;
    if same_file(&args.source, &args.target) {
        bail!("source and target cannot be the same");
    }
    let target = Arc::new(
        FileVolume::create(&args.target, len)
            .await
            .with_context(|| format!("create target {}", args.target.display()))?,
    );

    let sync_bitmap = match &args.bitmap {
        Some(path) => Some(load_bitmap(path)?),
        None => None,
    };

    let options = BackupOptions {
        job_id: "backup0".to_string(),
        speed: args.speed,
        sync_mode,
        sync_bitmap: sync_bitmap.clone(),
        bitmap_policy: args.bitmap_mode.into(),
        compress: false,
        on_source_error: args.on_source_error.into(),
        on_target_error: args.on_target_error.into(),
        ..Default::default()
    };
    let job = BackupJob::create(source, target.clone(), options)
        .await
        .context("create backup job")?;

    if !args.quiet {
        eprintln!(
            "source: {} ({} bytes)\ntarget: {} (cluster={} bytes)",
            args.source.display(),
            len,
            args.target.display(),
            job.cluster_size()
        );
    }

    let pb = if args.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("##-"),
    );

    let mut handle = job.start();
    let outcome = loop {
        match tokio::time::timeout(PROGRESS_TICK, handle.wait()).await {
            Ok(outcome) => break outcome,
            Err(_) => {
                let progress = handle.progress();
                pb.set_length(progress.total);
                pb.set_position(progress.current);
            }
        }
    };
    let progress = handle.progress();
    pb.set_length(progress.total);
    pb.set_position(progress.current);
    pb.finish_and_clear();

    // The saved bitmap may only drop clusters once the copy is durable.
    if outcome.is_completed() {
        target.flush().await.context("flush target")?;
    }
    if let (Some(path), Some(sync_bitmap)) = (&args.bitmap, &sync_bitmap) {
        save_bitmap(path, &sync_bitmap.snapshot())?;
    }

    let telemetry = handle.telemetry();
    tracing::info!(
        copied = telemetry.loop_copies + telemetry.notifier_copies,
        skipped = telemetry.clusters_skipped,
        read_errors = telemetry.read_errors,
        write_errors = telemetry.write_errors,
        "backup finished"
    );

    match outcome {
        JobOutcome::Completed => {
            let stats = target.stats();
            if !args.quiet {
                eprintln!(
                    "done: {} bytes written, {} flush(es)",
                    stats.write_bytes, stats.flush_ops
                );
            }
            Ok(())
        }
        JobOutcome::Cancelled => bail!("backup cancelled"),
        JobOutcome::Failed(err) => Err(err).context("backup failed"),
    }
}

fn bitmap(cmd: BitmapCommand) -> Result<()> {
    match cmd {
        BitmapCommand::Create {
            file,
            size,
            granularity,
            force,
        } => {
            if file.exists() && !force {
                bail!(
                    "refusing to overwrite {} (use --force to override)",
                    file.display()
                );
            }
            let bitmap = ClusterBitmap::new(size, granularity).context("create bitmap")?;
            save_bitmap(&file, &bitmap)
        }
        BitmapCommand::Mark {
            file,
            offset,
            length,
        } => {
            let mut bitmap = read_bitmap(&file)?;
            let end = offset
                .checked_add(length)
                .filter(|end| *end <= bitmap.len())
                .with_context(|| {
                    format!(
                        "range {offset}+{length} exceeds the bitmap size {}",
                        bitmap.len()
                    )
                })?;
            bitmap.set_range(offset, end - offset);
            save_bitmap(&file, &bitmap)
        }
        BitmapCommand::Show { file } => {
            let bitmap = read_bitmap(&file)?;
            let summary = BitmapSummary {
                size: bitmap.len(),
                granularity: bitmap.granularity(),
                dirty_bytes: bitmap.dirty_count(),
                dirty_clusters: bitmap.dirty_clusters(),
                ranges: bitmap.dirty_ranges().map(|r| [r.start, r.end]).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn read_bitmap(path: &Path) -> Result<ClusterBitmap> {
    let raw = fs::read(path).with_context(|| format!("read bitmap {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse bitmap {}", path.display()))
}

fn load_bitmap(path: &Path) -> Result<DirtyBitmap> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("bitmap")
        .to_string();
    Ok(DirtyBitmap::from_bitmap(name, read_bitmap(path)?))
}

fn save_bitmap(path: &Path, bitmap: &ClusterBitmap) -> Result<()> {
    let json = serde_json::to_vec_pretty(bitmap)?;
    fs::write(path, json).with_context(|| format!("write bitmap {}", path.display()))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
