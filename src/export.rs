//! Scene export: one JSON camera file per sequence with intrinsics resolved
//! to pixels, plus `manifest.txt` listing the files written.

use crate::autotune::{self, Stage};
use crate::download::METADATA_DIR;
use crate::extractor::frame_file_name;
use crate::manifest::{self, EXPORT_MANIFEST, SEQUENCE_LIST};
use crate::metadata::SequenceRecord;
use crate::pool::{self, WorkItem};
use crate::progress::{ExportSummary, ProgressConfig, ProgressHandle, ProgressReporter};
use crate::record;
use crate::util;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DEFAULT_FRAMES_DIR: &str = "images_org";
const SCENE_EXT: &str = "json";
const JSON_INDENT: &[u8] = b"    ";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneFrame {
    pub w: u32,
    pub h: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// World-to-camera, row-major, bottom row `0 0 0 1`.
    pub w2c: [[f32; 4]; 4],
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scene {
    pub frames: Vec<SceneFrame>,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Defaults to `<input_dir>/images_org`.
    pub frames_dir: Option<PathBuf>,
    pub max_seq: Option<usize>,
    pub workers: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportTotals {
    pub sequences: usize,
    pub written: usize,
    pub failed: usize,
    pub manifest_entries: usize,
}

struct SceneJob {
    record_path: PathBuf,
    json_path: PathBuf,
}

/// Embeds a row-major 3x4 pose into a 4x4 homogeneous matrix.
pub fn homogeneous(pose: &[f32; 12]) -> [[f32; 4]; 4] {
    let mut m = [[0.0f32; 4]; 4];
    for (r, row) in m.iter_mut().take(3).enumerate() {
        row.copy_from_slice(&pose[r * 4..r * 4 + 4]);
    }
    m[3] = [0.0, 0.0, 0.0, 1.0];
    m
}

/// Builds the scene of `record` for images of `width` x `height` pixels in
/// `seq_frames_dir`, which should be absolute.
pub fn build_scene(
    record: &SequenceRecord,
    seq_frames_dir: &Path,
    width: u32,
    height: u32,
) -> Scene {
    let (w, h) = (f64::from(width), f64::from(height));
    let frames = record
        .intrinsics()
        .iter()
        .zip(record.poses())
        .enumerate()
        .map(|(i, (k, pose))| SceneFrame {
            w: width,
            h: height,
            fx: f64::from(k[0]) * w,
            fy: f64::from(k[1]) * h,
            cx: f64::from(k[2]) * w,
            cy: f64::from(k[3]) * h,
            w2c: homogeneous(pose),
            file_path: seq_frames_dir.join(frame_file_name(i)).display().to_string(),
        })
        .collect();
    Scene { frames }
}

/// Serializes with 4-space indentation and replaces `path` atomically.
pub fn write_scene(scene: &Scene, path: &Path) -> Result<()> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(JSON_INDENT));
    scene
        .serialize(&mut ser)
        .with_context(|| format!("failed to serialize scene for {:?}", path))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    std::fs::write(&tmp, &buf).with_context(|| format!("failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to move scene into {:?}", path))?;
    Ok(())
}

fn export_sequence(
    job: &SceneJob,
    frames_dir: &Path,
    progress: &ProgressHandle,
) -> Result<PathBuf> {
    progress.log(format!("Processing {:?}", job.record_path));
    let rec = record::load(&job.record_path)?;
    let seq_frames = frames_dir.join(rec.sequence_id());
    let reference = seq_frames.join(frame_file_name(0));
    let (width, height) = image::image_dimensions(&reference)
        .with_context(|| format!("cannot read reference image {:?}", reference))?;

    let scene = build_scene(&rec, &seq_frames, width, height);
    write_scene(&scene, &job.json_path)?;
    Ok(job.json_path.clone())
}

pub fn run_export(config: &ExportConfig, progress_cfg: ProgressConfig) -> Result<ExportSummary> {
    let started = Instant::now();
    let reporter = ProgressReporter::new("export", 0, progress_cfg);
    let progress = reporter.handle();

    let workers = autotune::workers_for(Stage::Export, config.workers, &progress);
    let totals = export_all(config, workers, &progress)?;
    let outcome = reporter.finish("export complete");

    Ok(ExportSummary {
        input_dir: config.input_dir.clone(),
        output_dir: config.output_dir.clone(),
        sequences: totals.sequences,
        written: totals.written,
        failed: totals.failed,
        manifest_entries: totals.manifest_entries,
        workers,
        elapsed: started.elapsed(),
        avg_items_per_sec: outcome.avg_items_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

pub fn export_all(
    config: &ExportConfig,
    workers: usize,
    progress: &ProgressHandle,
) -> Result<ExportTotals> {
    let metadata_dir = config.input_dir.join(METADATA_DIR);
    let list_path = config.input_dir.join(SEQUENCE_LIST);
    let frames_dir = match &config.frames_dir {
        Some(dir) => dir.clone(),
        None => config.input_dir.join(DEFAULT_FRAMES_DIR),
    };
    util::ensure_dir(&metadata_dir, "metadata")?;
    util::ensure_file(&list_path, "sequence list")?;
    util::ensure_dir(&frames_dir, "frames")?;
    let frames_dir = util::absolute(&frames_dir)?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create output dir {:?}", config.output_dir))?;
    let output_dir = util::absolute(&config.output_dir)?;

    let mut entries = manifest::read_sequence_list(&list_path)?;
    if let Some(max) = config.max_seq {
        entries.truncate(max);
    }

    let items = entries
        .iter()
        .map(|entry| {
            WorkItem::new(
                entry.sequence_id.clone(),
                SceneJob {
                    record_path: record::record_path(&metadata_dir, &entry.sequence_id),
                    json_path: output_dir.join(format!("{}.{}", entry.sequence_id, SCENE_EXT)),
                },
            )
        })
        .collect::<Vec<_>>();

    progress.set_stage("exporting scenes");
    let reports = pool::run_pool(items, workers, progress, |_key, job: SceneJob| {
        export_sequence(&job, &frames_dir, progress)
    });

    let written = reports
        .iter()
        .filter_map(|r| r.output())
        .filter(|p| p.is_file())
        .cloned()
        .collect::<Vec<_>>();
    let manifest_path = output_dir.join(EXPORT_MANIFEST);
    manifest::write_path_list(&manifest_path, &written)?;
    progress.log(format!("Wrote {} entries to {:?}", written.len(), manifest_path));

    Ok(ExportTotals {
        sequences: entries.len(),
        written: reports.iter().filter(|r| r.output().is_some()).count(),
        failed: reports.iter().filter(|r| r.failure().is_some()).count(),
        manifest_entries: written.len(),
    })
}
