//! Extract stage: frame extraction for every listed sequence, followed by a
//! regenerated sequence list holding only complete frame sets.

use crate::autotune::{self, Stage};
use crate::download::{METADATA_DIR, RAW_DIR};
use crate::extractor::{self, ExtractOutcome, FrameDecoder, ResumePolicy};
use crate::fetch;
use crate::manifest::{self, ManifestEntry, SEQUENCE_LIST};
use crate::pool::{self, ItemStatus, WorkItem};
use crate::progress::{ExtractSummary, ProgressConfig, ProgressHandle, ProgressReporter};
use crate::record;
use crate::util;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// A split directory written by `download`: `raw/`, `metadata/`, `full_list.txt`.
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub resume: ResumePolicy,
    pub workers: Option<usize>,
    pub shuffle: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractTotals {
    pub sequences: usize,
    pub extracted: usize,
    pub already_complete: usize,
    pub failed: usize,
    pub frames_written: u64,
    pub sequences_listed: usize,
    pub sequences_dropped: usize,
}

struct SequenceJob {
    entry: ManifestEntry,
    record_path: PathBuf,
    video: PathBuf,
    output: PathBuf,
}

pub fn run_extract(
    config: &ExtractConfig,
    decoder: &dyn FrameDecoder,
    progress_cfg: ProgressConfig,
) -> Result<ExtractSummary> {
    let started = Instant::now();
    let reporter = ProgressReporter::new("extract", 0, progress_cfg);
    let progress = reporter.handle();

    let workers = autotune::workers_for(Stage::Extract, config.workers, &progress);
    let totals = extract_all(config, workers, decoder, &progress)?;
    let outcome = reporter.finish("extract complete");

    Ok(ExtractSummary {
        input_dir: config.input_dir.clone(),
        output_dir: config.output_dir.clone(),
        resume: config.resume.as_str().to_string(),
        sequences: totals.sequences,
        extracted: totals.extracted,
        already_complete: totals.already_complete,
        failed: totals.failed,
        frames_written: totals.frames_written,
        sequences_listed: totals.sequences_listed,
        sequences_dropped: totals.sequences_dropped,
        workers,
        elapsed: started.elapsed(),
        avg_items_per_sec: outcome.avg_items_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

pub fn extract_all(
    config: &ExtractConfig,
    workers: usize,
    decoder: &dyn FrameDecoder,
    progress: &ProgressHandle,
) -> Result<ExtractTotals> {
    let raw_dir = config.input_dir.join(RAW_DIR);
    let metadata_dir = config.input_dir.join(METADATA_DIR);
    let list_path = config.input_dir.join(SEQUENCE_LIST);
    util::ensure_dir(&config.input_dir, "input")?;
    util::ensure_dir(&raw_dir, "video")?;
    util::ensure_dir(&metadata_dir, "metadata")?;
    util::ensure_file(&list_path, "sequence list")?;

    let entries = manifest::read_sequence_list(&list_path)?;
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create output dir {:?}", config.output_dir))?;
    progress.log(format!(
        "Extracting {} sequences from {:?} into {:?} (resume={})",
        entries.len(),
        config.input_dir,
        config.output_dir,
        config.resume.as_str()
    ));

    let mut items = entries
        .iter()
        .map(|entry| {
            WorkItem::new(
                entry.sequence_id.clone(),
                SequenceJob {
                    entry: entry.clone(),
                    record_path: record::record_path(&metadata_dir, &entry.sequence_id),
                    video: fetch::video_path(&raw_dir, &entry.video_id),
                    output: config.output_dir.join(&entry.sequence_id),
                },
            )
        })
        .collect::<Vec<_>>();
    if config.shuffle {
        items.shuffle(&mut rand::thread_rng());
    }

    progress.set_stage("extracting frames");
    let reports = pool::run_pool(items, workers, progress, |_key, job: SequenceJob| {
        let rec = record::load(&job.record_path)?;
        let outcome = extractor::extract_sequence(
            &rec,
            &job.video,
            &job.output,
            config.resume,
            decoder,
            progress,
        )
        .with_context(|| format!("video {}", job.entry.video_id))?;
        Ok(outcome)
    });

    let mut totals = ExtractTotals {
        sequences: entries.len(),
        ..ExtractTotals::default()
    };
    for report in &reports {
        match report.status {
            ItemStatus::Done(ExtractOutcome::Extracted { frames }) => {
                totals.extracted += 1;
                totals.frames_written += frames as u64;
            }
            ItemStatus::Done(ExtractOutcome::AlreadyComplete) => totals.already_complete += 1,
            ItemStatus::Failed(_) => totals.failed += 1,
        }
    }

    progress.set_stage("rescanning outputs");
    let complete = rescan(&entries, &metadata_dir, &config.output_dir, config.resume, progress);
    totals.sequences_listed = complete.len();
    totals.sequences_dropped = entries.len() - complete.len();
    manifest::write_sequence_list(&config.output_dir.join(SEQUENCE_LIST), &complete)?;
    Ok(totals)
}

/// Entries whose frame set is complete on disk, in list order.
fn rescan(
    entries: &[ManifestEntry],
    metadata_dir: &Path,
    output_dir: &Path,
    resume: ResumePolicy,
    progress: &ProgressHandle,
) -> Vec<ManifestEntry> {
    let mut complete = Vec::with_capacity(entries.len());
    for entry in entries {
        let frames_dir = output_dir.join(&entry.sequence_id);
        let present = record::load(&record::record_path(metadata_dir, &entry.sequence_id))
            .map_err(anyhow::Error::from)
            .and_then(|rec| {
                extractor::frame_set_complete(
                    &frames_dir,
                    rec.frame_count(),
                    resume.checks_contents(),
                )
                .with_context(|| format!("inspect {:?}", frames_dir))
            });
        match present {
            Ok(true) => complete.push(entry.clone()),
            Ok(false) => progress.log(format!(
                "Dropping {} ({}): frames incomplete",
                entry.sequence_id, entry.video_id
            )),
            Err(err) => progress.log(format!(
                "Dropping {} ({}): {:#}",
                entry.sequence_id, entry.video_id, err
            )),
        }
    }
    complete
}
