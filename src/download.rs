//! Download stage: list retrieval, metadata parsing, video fetch and the
//! per-split `full_list.txt` + record files consumed by `extract`.

use crate::autotune::{self, Stage};
use crate::fetch::{self, FetchOutcome, VideoFetcher};
use crate::manifest::{self, ManifestEntry, SEQUENCE_LIST};
use crate::metadata::{self, SequenceRecord};
use crate::pool::{self, ItemStatus, WorkItem};
use crate::progress::{DownloadSummary, ProgressConfig, ProgressHandle, ProgressReporter};
use crate::record;
use crate::util;

use anyhow::{Context, Result};
use clap::ValueEnum;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const RAW_DIR: &str = "raw";
pub const METADATA_DIR: &str = "metadata";
pub const LISTS_DIR: &str = "lists";
const METADATA_EXT: &str = "txt";
const ARCHIVE_DOWNLOADER: &str = "curl";
const ARCHIVE_TOOL: &str = "tar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum SplitSelection {
    Train,
    Test,
    All,
}

impl SplitSelection {
    pub fn splits(self) -> &'static [&'static str] {
        match self {
            SplitSelection::Train => &["train"],
            SplitSelection::Test => &["test"],
            SplitSelection::All => &["train", "test"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// `http(s)://` archive URL or a local directory holding `train/` and `test/`.
    pub source: String,
    pub output_dir: PathBuf,
    pub split: SplitSelection,
    pub max_files: Option<usize>,
    pub workers: Option<usize>,
    pub shuffle: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadTotals {
    pub metadata_files: usize,
    pub parse_failures: usize,
    pub videos: usize,
    pub videos_fetched: usize,
    pub videos_skipped: usize,
    pub videos_failed: usize,
    pub sequences_listed: usize,
    pub sequences_dropped: usize,
}

struct SplitPlan {
    name: &'static str,
    dir: PathBuf,
    records: Vec<SequenceRecord>,
}

struct VideoJob {
    video_id: String,
    raw_dir: PathBuf,
}

pub fn run_download(
    config: &DownloadConfig,
    fetcher: &dyn VideoFetcher,
    progress_cfg: ProgressConfig,
) -> Result<DownloadSummary> {
    let started = Instant::now();
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create output dir {:?}", config.output_dir))?;

    let reporter = ProgressReporter::new("download", 0, progress_cfg);
    let progress = reporter.handle();

    progress.set_stage("resolving lists");
    let lists_root = resolve_lists(&config.source, &config.output_dir, &progress)?;

    let workers = autotune::workers_for(Stage::Download, config.workers, &progress);
    let totals = download_splits(config, &lists_root, workers, fetcher, &progress)?;
    let outcome = reporter.finish("download complete");

    Ok(DownloadSummary {
        output_dir: config.output_dir.clone(),
        splits: config.split.splits().iter().map(|s| s.to_string()).collect(),
        metadata_files: totals.metadata_files,
        parse_failures: totals.parse_failures,
        videos: totals.videos,
        videos_fetched: totals.videos_fetched,
        videos_skipped: totals.videos_skipped,
        videos_failed: totals.videos_failed,
        sequences_listed: totals.sequences_listed,
        sequences_dropped: totals.sequences_dropped,
        workers,
        elapsed: started.elapsed(),
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

fn resolve_lists(source: &str, output_dir: &Path, progress: &ProgressHandle) -> Result<PathBuf> {
    let root = if source.starts_with("http") {
        fetch::retrieve_lists(
            source,
            &output_dir.join(LISTS_DIR),
            Path::new(ARCHIVE_DOWNLOADER),
            Path::new(ARCHIVE_TOOL),
            progress,
        )
        .with_context(|| format!("failed to retrieve sequence lists from {}", source))?
    } else {
        PathBuf::from(source)
    };
    util::ensure_dir(&root, "sequence list")?;
    Ok(root)
}

/// Parses every requested split under `lists_root`, fetches the videos
/// they reference and writes each split's records and sequence list.
pub fn download_splits(
    config: &DownloadConfig,
    lists_root: &Path,
    workers: usize,
    fetcher: &dyn VideoFetcher,
    progress: &ProgressHandle,
) -> Result<DownloadTotals> {
    let mut totals = DownloadTotals::default();

    progress.set_stage("parsing metadata");
    let mut plans = Vec::new();
    for &name in config.split.splits() {
        let list_dir = lists_root.join(name);
        util::ensure_dir(&list_dir, "split list")?;
        let mut files = util::list_files_with_ext(&list_dir, METADATA_EXT)?;
        if let Some(max) = config.max_files {
            files.truncate(max);
        }
        totals.metadata_files += files.len();

        let mut records = Vec::with_capacity(files.len());
        for path in &files {
            match metadata::parse_metadata_file(path) {
                Ok(rec) => records.push(rec),
                Err(err) => {
                    totals.parse_failures += 1;
                    progress.warn(format!("Skipping unparsable metadata: {}", err));
                }
            }
        }
        progress.log(format!(
            "{}: {} metadata files, {} parsed",
            name,
            files.len(),
            records.len()
        ));
        plans.push(SplitPlan {
            name,
            dir: config.output_dir.join(name),
            records,
        });
    }

    let mut items = Vec::new();
    for plan in &plans {
        let raw_dir = plan.dir.join(RAW_DIR);
        std::fs::create_dir_all(&raw_dir)
            .with_context(|| format!("failed to create {:?}", raw_dir))?;
        let mut seen = HashSet::new();
        for rec in &plan.records {
            if seen.insert(rec.video_id()) {
                items.push(WorkItem::new(
                    format!("{}/{}", plan.name, rec.video_id()),
                    VideoJob {
                        video_id: rec.video_id().to_string(),
                        raw_dir: raw_dir.clone(),
                    },
                ));
            }
        }
    }
    if config.shuffle {
        items.shuffle(&mut rand::thread_rng());
    }
    totals.videos = items.len();

    progress.set_stage("fetching videos");
    let reports = pool::run_pool(items, workers, progress, |_key, job: VideoJob| {
        Ok(fetch::fetch_video(fetcher, &job.video_id, &job.raw_dir, progress)?)
    });
    for report in &reports {
        match report.status {
            ItemStatus::Done(FetchOutcome::Downloaded) => totals.videos_fetched += 1,
            ItemStatus::Done(FetchOutcome::AlreadyPresent) => totals.videos_skipped += 1,
            ItemStatus::Failed(_) => totals.videos_failed += 1,
        }
    }

    progress.set_stage("writing records");
    for plan in &plans {
        let (listed, dropped) = write_split_outputs(plan, progress)?;
        totals.sequences_listed += listed;
        totals.sequences_dropped += dropped;
    }
    Ok(totals)
}

/// Persists the records of sequences whose video is on disk and lists them.
fn write_split_outputs(plan: &SplitPlan, progress: &ProgressHandle) -> Result<(usize, usize)> {
    let raw_dir = plan.dir.join(RAW_DIR);
    let metadata_dir = plan.dir.join(METADATA_DIR);
    std::fs::create_dir_all(&metadata_dir)
        .with_context(|| format!("failed to create {:?}", metadata_dir))?;

    let mut entries = Vec::with_capacity(plan.records.len());
    let mut dropped = 0usize;
    for rec in &plan.records {
        let video = fetch::video_path(&raw_dir, rec.video_id());
        if !video.is_file() {
            dropped += 1;
            progress.log(format!(
                "Dropping {} ({}): video not available",
                rec.sequence_id(),
                rec.video_id()
            ));
            continue;
        }
        if let Err(err) = record::save(rec, &metadata_dir) {
            dropped += 1;
            progress.error(format!("Dropping {}: {}", rec.sequence_id(), err));
            continue;
        }
        entries.push(ManifestEntry::new(rec.sequence_id(), rec.video_id()));
    }

    let list_path = plan.dir.join(SEQUENCE_LIST);
    manifest::write_sequence_list(&list_path, &entries)?;
    progress.log(format!(
        "{}: {} sequences listed in {:?}, {} dropped",
        plan.name,
        entries.len(),
        list_path,
        dropped
    ));
    Ok((entries.len(), dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::FakeFetcher;
    use crate::metadata::tests::metadata_text;
    use crate::progress::quiet_reporter;
    use tempfile::TempDir;

    fn write_lists(root: &Path, split: &str, files: &[(&str, String)]) {
        let dir = root.join(split);
        std::fs::create_dir_all(&dir).expect("mkdir");
        for (name, text) in files {
            std::fs::write(dir.join(name), text).expect("write list file");
        }
    }

    fn config(output: &Path, split: SplitSelection) -> DownloadConfig {
        DownloadConfig {
            source: String::new(),
            output_dir: output.to_path_buf(),
            split,
            max_files: None,
            workers: Some(2),
            shuffle: false,
        }
    }

    fn train_fixture(lists: &Path) {
        write_lists(
            lists,
            "train",
            &[
                ("aaa.txt", metadata_text("vid1", &[0, 33000])),
                ("bbb.txt", metadata_text("vid2", &[1000])),
                ("ccc.txt", metadata_text("vid1", &[66000])),
                ("ddd.txt", "camera=vid3\n1 2 3\n".to_string()),
            ],
        );
    }

    #[test]
    fn sequences_without_video_are_left_out_of_the_list() {
        let tmp = TempDir::new().expect("tempdir");
        let lists = tmp.path().join("lists");
        let out = tmp.path().join("out");
        train_fixture(&lists);

        let reporter = quiet_reporter("download");
        let fetcher = FakeFetcher::without(&["vid2"]);
        let totals = download_splits(
            &config(&out, SplitSelection::Train),
            &lists,
            2,
            &fetcher,
            &reporter.handle(),
        )
        .expect("download");

        assert_eq!(
            totals,
            DownloadTotals {
                metadata_files: 4,
                parse_failures: 1,
                videos: 2,
                videos_fetched: 1,
                videos_skipped: 0,
                videos_failed: 1,
                sequences_listed: 2,
                sequences_dropped: 1,
            }
        );
        assert_eq!(fetcher.calls(), 2);

        let split = out.join("train");
        assert_eq!(
            std::fs::read_to_string(split.join(SEQUENCE_LIST)).expect("list"),
            "aaa vid1\nccc vid1\n"
        );
        assert!(split.join("raw").join("vid1.mp4").is_file());
        assert!(!split.join("raw").join("vid2.mp4").exists());

        let aaa = record::load(&record::record_path(&split.join(METADATA_DIR), "aaa"))
            .expect("load");
        assert_eq!(aaa.timestamps(), &[0, 33000]);
        assert!(!record::record_path(&split.join(METADATA_DIR), "bbb").exists());
    }

    #[test]
    fn rerun_only_fetches_missing_videos() {
        let tmp = TempDir::new().expect("tempdir");
        let lists = tmp.path().join("lists");
        let out = tmp.path().join("out");
        train_fixture(&lists);
        let reporter = quiet_reporter("download");
        let cfg = config(&out, SplitSelection::Train);

        download_splits(&cfg, &lists, 2, &FakeFetcher::without(&["vid2"]), &reporter.handle())
            .expect("first run");

        let second = FakeFetcher::default();
        let totals =
            download_splits(&cfg, &lists, 2, &second, &reporter.handle()).expect("second run");
        assert_eq!(second.calls(), 1);
        assert_eq!(totals.videos_skipped, 1);
        assert_eq!(totals.videos_fetched, 1);
        assert_eq!(
            std::fs::read_to_string(out.join("train").join(SEQUENCE_LIST)).expect("list"),
            "aaa vid1\nbbb vid2\nccc vid1\n"
        );
    }

    #[test]
    fn max_files_keeps_the_first_files_in_name_order() {
        let tmp = TempDir::new().expect("tempdir");
        let lists = tmp.path().join("lists");
        let out = tmp.path().join("out");
        train_fixture(&lists);
        let reporter = quiet_reporter("download");
        let mut cfg = config(&out, SplitSelection::Train);
        cfg.max_files = Some(1);

        let totals = download_splits(&cfg, &lists, 4, &FakeFetcher::default(), &reporter.handle())
            .expect("download");
        assert_eq!(totals.metadata_files, 1);
        assert_eq!(totals.sequences_listed, 1);
        assert_eq!(
            std::fs::read_to_string(out.join("train").join(SEQUENCE_LIST)).expect("list"),
            "aaa vid1\n"
        );
    }

    #[test]
    fn missing_split_directory_fails_before_fetching() {
        let tmp = TempDir::new().expect("tempdir");
        let lists = tmp.path().join("lists");
        train_fixture(&lists);
        let reporter = quiet_reporter("download");
        let fetcher = FakeFetcher::default();

        let err = download_splits(
            &config(&tmp.path().join("out"), SplitSelection::All),
            &lists,
            2,
            &fetcher,
            &reporter.handle(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("split list"), "{err}");
        assert_eq!(fetcher.calls(), 0);
    }
}
