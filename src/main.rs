mod autotune;
mod download;
mod export;
mod extractor;
mod fetch;
mod manifest;
mod metadata;
mod pool;
mod process;
mod progress;
mod record;
mod util;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::HumanCount;
use progress::{
    format_duration, format_rate, DownloadSummary, ExportSummary, ExtractSummary, LogSink,
    ProgressConfig, ProgressMode,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Warnings printed under a summary before the rest are only counted.
const MAX_PRINTED_WARNINGS: usize = 20;

#[derive(Parser)]
#[command(
    name = "re10k",
    version,
    about = "RealEstate10K dataset preparation: video download, frame extraction, scene export"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Worker pool size. Default: auto.
    #[arg(long, short = 'n')]
    num_workers: Option<usize>,

    /// Also append every log line to this file.
    #[arg(long, short = 'l')]
    log_file: Option<PathBuf>,

    /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch sequence lists and source videos, write records and full_list.txt per split
    Download {
        /// List archive URL, or a local directory holding train/ and test/
        #[arg(long, default_value = fetch::DEFAULT_LIST_SOURCE)]
        source: String,

        #[arg(long, short = 'o')]
        output_dir: PathBuf,

        #[arg(long, short = 's', value_enum, default_value_t = download::SplitSelection::All)]
        split: download::SplitSelection,

        /// Only use the first N metadata files of each split.
        #[arg(long, short = 'm')]
        max_files: Option<usize>,

        /// yt-dlp compatible fetcher.
        #[arg(long, default_value = "yt-dlp")]
        fetcher_bin: PathBuf,

        /// Fetch videos in list order instead of a random one.
        #[arg(long, default_value_t = false)]
        no_shuffle: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Extract one image per timestamp for every listed sequence
    Extract {
        /// Split directory with raw/, metadata/ and full_list.txt
        #[arg(long, short = 'i')]
        input_dir: PathBuf,

        #[arg(long, short = 'o')]
        output_dir: PathBuf,

        /// How to treat frame directories left by an earlier run.
        #[arg(long, value_enum, default_value_t = extractor::ResumePolicy::Verified)]
        resume: extractor::ResumePolicy,

        #[arg(long, default_value = "ffmpeg")]
        ffmpeg_bin: PathBuf,

        /// Process sequences in list order instead of a random one.
        #[arg(long, default_value_t = false)]
        no_shuffle: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Write one scene JSON per sequence plus manifest.txt
    Export {
        /// Split directory with metadata/ and full_list.txt
        #[arg(long, short = 'i')]
        input_dir: PathBuf,

        #[arg(long, short = 'o')]
        output_dir: PathBuf,

        /// Extracted frames. Default: <input-dir>/images_org
        #[arg(long)]
        frames_dir: Option<PathBuf>,

        /// Only export the first N listed sequences.
        #[arg(long, short = 'm')]
        max_seq: Option<usize>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Download {
            source,
            output_dir,
            split,
            max_files,
            fetcher_bin,
            no_shuffle,
            common,
        } => {
            util::ensure_tool_available(&fetcher_bin, "--version")
                .with_context(|| format!("{} not found in PATH", fetcher_bin.display()))?;
            let fetcher = fetch::YtDlpFetcher::new(fetcher_bin);
            let summary = download::run_download(
                &download::DownloadConfig {
                    source,
                    output_dir,
                    split,
                    max_files,
                    workers: common.num_workers,
                    shuffle: !no_shuffle,
                },
                &fetcher,
                progress_config(&common)?,
            )?;
            print_download_summary(&summary);
        }

        Commands::Extract {
            input_dir,
            output_dir,
            resume,
            ffmpeg_bin,
            no_shuffle,
            common,
        } => {
            util::ensure_tool_available(&ffmpeg_bin, "-version")
                .with_context(|| format!("{} not found in PATH", ffmpeg_bin.display()))?;
            let decoder = extractor::FfmpegDecoder::new(ffmpeg_bin);
            let summary = process::run_extract(
                &process::ExtractConfig {
                    input_dir,
                    output_dir,
                    resume,
                    workers: common.num_workers,
                    shuffle: !no_shuffle,
                },
                &decoder,
                progress_config(&common)?,
            )?;
            print_extract_summary(&summary);
        }

        Commands::Export {
            input_dir,
            output_dir,
            frames_dir,
            max_seq,
            common,
        } => {
            let summary = export::run_export(
                &export::ExportConfig {
                    input_dir,
                    output_dir,
                    frames_dir,
                    max_seq,
                    workers: common.num_workers,
                },
                progress_config(&common)?,
            )?;
            print_export_summary(&summary);
        }
    }

    Ok(())
}

fn progress_config(common: &CommonArgs) -> Result<ProgressConfig> {
    let sink = match &common.log_file {
        Some(path) => Some(Arc::new(LogSink::open(path)?)),
        None => None,
    };
    Ok(ProgressConfig::new(common.progress).with_log_sink(sink))
}

fn print_download_summary(summary: &DownloadSummary) {
    println!(
        "Download summary: output={} splits={} duration={} metadata_files={} parse_failures={} videos={} fetched={} skipped={} failed={} sequences={} dropped={} workers={} warnings={}",
        summary.output_dir.display(),
        summary.splits.join(","),
        format_duration(summary.elapsed),
        summary.metadata_files,
        summary.parse_failures,
        summary.videos,
        summary.videos_fetched,
        summary.videos_skipped,
        summary.videos_failed,
        summary.sequences_listed,
        summary.sequences_dropped,
        summary.workers,
        summary.warning_count,
    );
    print_warnings(&summary.warnings, summary.warning_count);
}

fn print_extract_summary(summary: &ExtractSummary) {
    println!(
        "Extract summary: input={} output={} resume={} duration={} throughput={} sequences={} extracted={} already_complete={} failed={} frames={} listed={} dropped={} workers={} warnings={}",
        summary.input_dir.display(),
        summary.output_dir.display(),
        summary.resume,
        format_duration(summary.elapsed),
        format_rate(summary.avg_items_per_sec),
        summary.sequences,
        summary.extracted,
        summary.already_complete,
        summary.failed,
        HumanCount(summary.frames_written),
        summary.sequences_listed,
        summary.sequences_dropped,
        summary.workers,
        summary.warning_count,
    );
    print_warnings(&summary.warnings, summary.warning_count);
}

fn print_export_summary(summary: &ExportSummary) {
    println!(
        "Export summary: input={} output={} duration={} throughput={} sequences={} written={} failed={} manifest_entries={} workers={} warnings={}",
        summary.input_dir.display(),
        summary.output_dir.display(),
        format_duration(summary.elapsed),
        format_rate(summary.avg_items_per_sec),
        summary.sequences,
        summary.written,
        summary.failed,
        summary.manifest_entries,
        summary.workers,
        summary.warning_count,
    );
    print_warnings(&summary.warnings, summary.warning_count);
}

fn print_warnings(warnings: &[String], total: usize) {
    for warning in warnings.iter().take(MAX_PRINTED_WARNINGS) {
        println!("  warning: {}", warning);
    }
    if total > MAX_PRINTED_WARNINGS {
        println!("  ... and {} more warnings", total - MAX_PRINTED_WARNINGS);
    }
}
