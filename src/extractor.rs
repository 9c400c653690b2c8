//! Materializes one still image per timestamp of a sequence.
//!
//! The output directory of a sequence is all-or-nothing: it is either
//! complete (and left alone on re-runs) or it does not exist.

use crate::metadata::SequenceRecord;
use crate::progress::ProgressHandle;

use clap::ValueEnum;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

pub const FRAME_EXT: &str = "png";

const MS_PER_HOUR: u64 = 3_600_000;
const MS_PER_MINUTE: u64 = 60_000;
const MS_PER_SECOND: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("source video {0:?} does not exist")]
    MissingSource(PathBuf),
    #[error("frame {frame} has negative timestamp {timestamp}")]
    NegativeTimestamp { frame: usize, timestamp: i64 },
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("decoder failed on frame {frame} at {offset} ({status}): {detail}")]
    DecoderFailed {
        frame: usize,
        offset: String,
        status: String,
        detail: String,
    },
    #[error("decoder reported success but wrote no image for frame {frame} at {offset}")]
    MissingOutput { frame: usize, offset: String },
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What to do with an output directory left over from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ResumePolicy {
    /// Skip only if every expected image is present and non-empty.
    Verified,
    /// Skip if the number of entries equals the frame count.
    Count,
    /// Always discard and rebuild.
    Rebuild,
}

impl ResumePolicy {
    /// Whether completeness checks look at file names and sizes.
    pub fn checks_contents(self) -> bool {
        !matches!(self, ResumePolicy::Count)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResumePolicy::Verified => "verified",
            ResumePolicy::Count => "count",
            ResumePolicy::Rebuild => "rebuild",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    AlreadyComplete,
    Extracted { frames: usize },
}

/// One seek-and-decode invocation.
#[derive(Debug, Clone, Copy)]
pub struct FrameRequest<'a> {
    pub index: usize,
    pub offset: &'a str,
    pub source: &'a Path,
    pub target: &'a Path,
}

/// Decodes exactly one frame at an offset into an image file.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, request: &FrameRequest<'_>) -> Result<(), ExtractError>;
}

/// Runs `ffmpeg -ss <offset> -i <source> -vframes 1 -f image2 <target>`.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    program: PathBuf,
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn decode(&self, request: &FrameRequest<'_>) -> Result<(), ExtractError> {
        let out = Command::new(&self.program)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-ss")
            .arg(request.offset)
            .arg("-i")
            .arg(request.source)
            .arg("-vframes")
            .arg("1")
            .arg("-f")
            .arg("image2")
            .arg(request.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| ExtractError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ExtractError::DecoderFailed {
                frame: request.index,
                offset: request.offset.to_string(),
                status: out.status.to_string(),
                detail: stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("-")
                    .trim()
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// `HH:MM:SS.mmm` seek offset for a microsecond timestamp. Sub-millisecond
/// precision is truncated.
pub fn format_offset(timestamp_us: u64) -> String {
    let ms = timestamp_us / 1000;
    let hours = ms / MS_PER_HOUR;
    let minutes = (ms % MS_PER_HOUR) / MS_PER_MINUTE;
    let seconds = (ms % MS_PER_MINUTE) / MS_PER_SECOND;
    let millis = ms % MS_PER_SECOND;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}

pub fn frame_file_name(index: usize) -> String {
    format!("{:04}.{}", index, FRAME_EXT)
}

/// Whether `dir` holds a complete frame set of `frame_count` images.
///
/// Without `check_contents` only the number of entries is compared.
pub fn frame_set_complete(
    dir: &Path,
    frame_count: usize,
    check_contents: bool,
) -> io::Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut entries = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        entries += 1;
        if check_contents {
            let meta = entry.metadata()?;
            if !meta.is_file() || meta.len() == 0 {
                return Ok(false);
            }
        }
    }
    if entries != frame_count {
        return Ok(false);
    }
    if check_contents {
        for i in 0..frame_count {
            if !dir.join(frame_file_name(i)).is_file() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Extracts every frame of `record` from `video` into `output_dir`.
///
/// Frames are decoded strictly in timestamp order and the first failure
/// aborts the sequence; on any error `output_dir` is removed before
/// returning.
pub fn extract_sequence(
    record: &SequenceRecord,
    video: &Path,
    output_dir: &Path,
    policy: ResumePolicy,
    decoder: &dyn FrameDecoder,
    progress: &ProgressHandle,
) -> Result<ExtractOutcome, ExtractError> {
    let seq = record.sequence_id();
    let frame_count = record.frame_count();

    if output_dir.exists() {
        let complete = policy != ResumePolicy::Rebuild
            && frame_set_complete(output_dir, frame_count, policy.checks_contents()).map_err(
                |source| ExtractError::Io {
                    op: "inspect",
                    path: output_dir.to_path_buf(),
                    source,
                },
            )?;
        if complete {
            progress.log(format!("Skipping {}, frames already complete: {:?}", seq, output_dir));
            return Ok(ExtractOutcome::AlreadyComplete);
        }
        progress.log(format!("Discarding incomplete frames of {}: {:?}", seq, output_dir));
        remove_output(output_dir)?;
    }

    if !video.is_file() {
        return Err(ExtractError::MissingSource(video.to_path_buf()));
    }

    let offsets = record
        .timestamps()
        .iter()
        .enumerate()
        .map(|(frame, &timestamp)| {
            u64::try_from(timestamp)
                .map(format_offset)
                .map_err(|_| ExtractError::NegativeTimestamp { frame, timestamp })
        })
        .collect::<Result<Vec<_>, _>>()?;

    std::fs::create_dir_all(output_dir).map_err(|source| ExtractError::Io {
        op: "create",
        path: output_dir.to_path_buf(),
        source,
    })?;

    progress.log(format!(
        "Start processing {} ({}) with {} frames",
        seq,
        record.video_id(),
        frame_count
    ));

    for (index, offset) in offsets.iter().enumerate() {
        let target = output_dir.join(frame_file_name(index));
        let request = FrameRequest {
            index,
            offset: offset.as_str(),
            source: video,
            target: &target,
        };
        let result = decoder.decode(&request).and_then(|()| {
            if target.is_file() {
                Ok(())
            } else {
                Err(ExtractError::MissingOutput {
                    frame: index,
                    offset: offset.clone(),
                })
            }
        });

        if let Err(err) = result {
            if let Err(cleanup) = remove_output(output_dir) {
                progress.error(format!("{}: cleanup after failure also failed: {}", seq, cleanup));
            }
            return Err(err);
        }
    }

    Ok(ExtractOutcome::Extracted {
        frames: frame_count,
    })
}

fn remove_output(path: &Path) -> Result<(), ExtractError> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExtractError::Io {
            op: "remove",
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::progress::quiet_reporter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Stand-in for the external decoder: writes a small file per request.
    #[derive(Default)]
    pub(crate) struct FakeDecoder {
        pub calls: AtomicUsize,
        pub offsets: Mutex<Vec<String>>,
        pub fail_at: Option<usize>,
        pub write_nothing: bool,
    }

    impl FakeDecoder {
        pub(crate) fn failing_at(frame: usize) -> Self {
            Self {
                fail_at: Some(frame),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FrameDecoder for FakeDecoder {
        fn decode(&self, request: &FrameRequest<'_>) -> Result<(), ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.offsets.lock().unwrap().push(request.offset.to_string());
            if self.fail_at == Some(request.index) {
                return Err(ExtractError::DecoderFailed {
                    frame: request.index,
                    offset: request.offset.to_string(),
                    status: "exit status: 1".to_string(),
                    detail: "seek past end of stream".to_string(),
                });
            }
            if !self.write_nothing {
                std::fs::write(request.target, b"\x89PNG fake").expect("write fake frame");
            }
            Ok(())
        }
    }

    fn record(timestamps: Vec<i64>) -> SequenceRecord {
        let n = timestamps.len();
        SequenceRecord::new("seq01", "vid01", timestamps, vec![[0.5; 4]; n], vec![[0.0; 12]; n])
            .expect("record")
    }

    struct Fixture {
        _tmp: TempDir,
        video: PathBuf,
        out: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let video = tmp.path().join("vid01.mp4");
        std::fs::write(&video, b"not really a video").expect("write video");
        let out = tmp.path().join("frames").join("seq01");
        Fixture {
            video,
            out,
            _tmp: tmp,
        }
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names = std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn offsets_use_hour_minute_second_millis() {
        assert_eq!(format_offset(3_725_250), "00:00:03.725");
        assert_eq!(format_offset(63_725_000), "00:01:03.725");
        assert_eq!(format_offset(3_599_999_999), "00:59:59.999");
        assert_eq!(format_offset(0), "00:00:00.000");
        assert_eq!(format_offset(3_600_000_000), "01:00:00.000");
        assert_eq!(format_offset(999), "00:00:00.000");
        assert_eq!(format_offset(45_045_000), "00:00:45.045");
        assert_eq!(format_offset(7_384_001_999), "02:03:04.001");
    }

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(frame_file_name(0), "0000.png");
        assert_eq!(frame_file_name(42), "0042.png");
        assert_eq!(frame_file_name(12345), "12345.png");
    }

    #[test]
    fn extracts_frames_in_timestamp_order() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let decoder = FakeDecoder::default();
        let rec = record(vec![0, 3_725_250, 3_600_000_000]);

        let outcome = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .expect("extract");

        assert_eq!(outcome, ExtractOutcome::Extracted { frames: 3 });
        assert_eq!(names_in(&fx.out), vec!["0000.png", "0001.png", "0002.png"]);
        assert_eq!(
            *decoder.offsets.lock().unwrap(),
            vec!["00:00:00.000", "00:00:03.725", "01:00:00.000"]
        );
    }

    #[test]
    fn second_run_on_complete_output_decodes_nothing() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let rec = record(vec![0, 1_000_000]);

        for policy in [ResumePolicy::Verified, ResumePolicy::Count] {
            let first = FakeDecoder::default();
            extract_sequence(
                &rec,
                &fx.video,
                &fx.out,
                ResumePolicy::Rebuild,
                &first,
                &reporter.handle(),
            )
            .expect("first run");

            let second = FakeDecoder::default();
            let outcome =
                extract_sequence(&rec, &fx.video, &fx.out, policy, &second, &reporter.handle())
                    .expect("second run");
            assert_eq!(outcome, ExtractOutcome::AlreadyComplete);
            assert_eq!(second.calls(), 0, "policy {policy:?}");
        }
    }

    #[test]
    fn failure_on_kth_frame_removes_directory() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let decoder = FakeDecoder::failing_at(2);
        let rec = record(vec![0, 1_000, 2_000, 3_000, 4_000]);

        let err = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .unwrap_err();

        assert!(matches!(err, ExtractError::DecoderFailed { frame: 2, .. }), "{err}");
        assert_eq!(decoder.calls(), 3, "frames after the failure must not be attempted");
        assert!(!fx.out.exists(), "partial frames left behind");
    }

    #[test]
    fn decoder_success_without_image_counts_as_failure() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let decoder = FakeDecoder {
            write_nothing: true,
            ..FakeDecoder::default()
        };
        let err = extract_sequence(
            &record(vec![10_000_000]),
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::MissingOutput { frame: 0, .. }), "{err}");
        assert!(!fx.out.exists());
    }

    #[test]
    fn partial_directory_is_rebuilt_from_scratch() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        std::fs::create_dir_all(&fx.out).expect("mkdir");
        std::fs::write(fx.out.join("0000.png"), b"old").expect("write");
        std::fs::write(fx.out.join("stray.tmp"), b"x").expect("write");

        let decoder = FakeDecoder::default();
        let outcome = extract_sequence(
            &record(vec![0, 1, 2]),
            &fx.video,
            &fx.out,
            ResumePolicy::Count,
            &decoder,
            &reporter.handle(),
        )
        .expect("extract");

        assert_eq!(outcome, ExtractOutcome::Extracted { frames: 3 });
        assert_eq!(decoder.calls(), 3);
        assert_eq!(names_in(&fx.out), vec!["0000.png", "0001.png", "0002.png"]);
    }

    #[test]
    fn count_policy_trusts_any_files_but_verified_does_not() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let rec = record(vec![0, 1, 2]);

        let make_junk = || {
            std::fs::create_dir_all(&fx.out).expect("mkdir");
            for name in ["a", "b", "c"] {
                std::fs::write(fx.out.join(name), b"").expect("write junk");
            }
        };

        make_junk();
        let counting = FakeDecoder::default();
        let outcome = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Count,
            &counting,
            &reporter.handle(),
        )
        .expect("count policy");
        assert_eq!(outcome, ExtractOutcome::AlreadyComplete);
        assert_eq!(counting.calls(), 0);

        let verifying = FakeDecoder::default();
        let outcome = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &verifying,
            &reporter.handle(),
        )
        .expect("verified policy");
        assert_eq!(outcome, ExtractOutcome::Extracted { frames: 3 });
        assert_eq!(verifying.calls(), 3);
    }

    #[test]
    fn verified_policy_rejects_wrongly_named_frames() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let rec = record(vec![0, 1, 2]);
        std::fs::create_dir_all(&fx.out).expect("mkdir");
        for name in ["a", "b", "c"] {
            std::fs::write(fx.out.join(name), b"not empty").expect("write stray");
        }

        assert!(frame_set_complete(&fx.out, 3, false).expect("inspect"));
        assert!(!frame_set_complete(&fx.out, 3, true).expect("inspect"));

        let decoder = FakeDecoder::default();
        let outcome = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .expect("verified policy");
        assert_eq!(outcome, ExtractOutcome::Extracted { frames: 3 });
        assert_eq!(decoder.calls(), 3);
        assert_eq!(names_in(&fx.out), vec!["0000.png", "0001.png", "0002.png"]);
    }

    #[test]
    fn empty_image_fails_verification() {
        let fx = fixture();
        std::fs::create_dir_all(&fx.out).expect("mkdir");
        std::fs::write(fx.out.join("0000.png"), b"png").expect("write");
        std::fs::write(fx.out.join("0001.png"), b"").expect("write");
        assert!(!frame_set_complete(&fx.out, 2, true).expect("inspect"));
        assert!(frame_set_complete(&fx.out, 2, false).expect("inspect"));
        assert!(!frame_set_complete(&fx.out.join("absent"), 0, false).expect("inspect"));
    }

    #[test]
    fn rebuild_policy_always_decodes() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let rec = record(vec![0, 1]);
        extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &FakeDecoder::default(),
            &reporter.handle(),
        )
        .expect("first");

        let decoder = FakeDecoder::default();
        let outcome = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Rebuild,
            &decoder,
            &reporter.handle(),
        )
        .expect("rebuild");
        assert_eq!(outcome, ExtractOutcome::Extracted { frames: 2 });
        assert_eq!(decoder.calls(), 2);
    }

    #[test]
    fn missing_source_or_negative_timestamp_leaves_nothing() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let decoder = FakeDecoder::default();

        let err = extract_sequence(
            &record(vec![0]),
            &fx.video.with_file_name("other.mp4"),
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::MissingSource(_)), "{err}");

        let err = extract_sequence(
            &record(vec![0, -5]),
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .unwrap_err();
        assert!(
            matches!(err, ExtractError::NegativeTimestamp { frame: 1, timestamp: -5 }),
            "{err}"
        );
        assert_eq!(decoder.calls(), 0);
        assert!(!fx.out.exists());
    }

    #[test]
    fn zero_frame_sequence_yields_empty_complete_directory() {
        let fx = fixture();
        let reporter = quiet_reporter("test");
        let decoder = FakeDecoder::default();
        let rec = record(vec![]);
        let outcome = extract_sequence(
            &rec,
            &fx.video,
            &fx.out,
            ResumePolicy::Verified,
            &decoder,
            &reporter.handle(),
        )
        .expect("extract");
        assert_eq!(outcome, ExtractOutcome::Extracted { frames: 0 });
        assert!(frame_set_complete(&fx.out, 0, true).expect("inspect"));
    }
}
