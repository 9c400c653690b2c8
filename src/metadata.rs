//! Per-sequence camera metadata: the text format published with the dataset
//! and the normalized in-memory record every later stage consumes.
//!
//! A metadata file looks like
//!
//! ```text
//! https://www.youtube.com/watch?v=abc123
//! 45045000 0.48 0.86 0.5 0.5 0 0 1 0 0 0 0 1 0 0 0 0 1 0
//! ...
//! ```
//!
//! where the first line is `<key>=<video_id>` and every other line is
//! `timestamp fx fy cx cy <unused> <unused> r11 r12 r13 tx r21 r22 r23 ty r31 r32 r33 tz`.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fields on a frame line.
pub const FIELDS_PER_LINE: usize = 19;
const INTRINSICS_AT: usize = 1;
const POSE_AT: usize = 7;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read metadata {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?}: metadata file is empty")]
    Empty { path: PathBuf },
    #[error("{path:?}: cannot derive a sequence id from the file name")]
    SequenceId { path: PathBuf },
    #[error("{path:?}: header {header:?} does not carry a `key=video_id` pair")]
    Header { path: PathBuf, header: String },
    #[error("{path:?}:{line}: expected {expected} fields, found {found}", expected = FIELDS_PER_LINE)]
    FieldCount {
        path: PathBuf,
        line: usize,
        found: usize,
    },
    #[error("{path:?}:{line}: field {column} ({value:?}) is not a valid number")]
    Number {
        path: PathBuf,
        line: usize,
        column: usize,
        value: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("sequence {sequence_id}: {timestamps} timestamps, {intrinsics} intrinsics, {poses} poses")]
pub struct LengthMismatch {
    pub sequence_id: String,
    pub timestamps: usize,
    pub intrinsics: usize,
    pub poses: usize,
}

/// Normalized metadata of one sequence.
///
/// Immutable once built; the per-frame arrays always have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRecord {
    sequence_id: String,
    video_id: String,
    timestamps: Vec<i64>,
    intrinsics: Vec<[f32; 4]>,
    poses: Vec<[f32; 12]>,
}

impl SequenceRecord {
    pub fn new(
        sequence_id: impl Into<String>,
        video_id: impl Into<String>,
        timestamps: Vec<i64>,
        intrinsics: Vec<[f32; 4]>,
        poses: Vec<[f32; 12]>,
    ) -> Result<Self, LengthMismatch> {
        let sequence_id = sequence_id.into();
        if timestamps.len() != intrinsics.len() || timestamps.len() != poses.len() {
            return Err(LengthMismatch {
                sequence_id,
                timestamps: timestamps.len(),
                intrinsics: intrinsics.len(),
                poses: poses.len(),
            });
        }
        Ok(Self {
            sequence_id,
            video_id: video_id.into(),
            timestamps,
            intrinsics,
            poses,
        })
    }

    pub fn sequence_id(&self) -> &str {
        &self.sequence_id
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn frame_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Microsecond offsets into the source video.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// `fx fy cx cy` as fractions of image width/height.
    pub fn intrinsics(&self) -> &[[f32; 4]] {
        &self.intrinsics
    }

    /// Row-major 3x4 world-to-camera transforms.
    pub fn poses(&self) -> &[[f32; 12]] {
        &self.poses
    }
}

/// Everything up to the first `.` of the file name, so `abc.txt` and
/// `abc.tar.txt` both yield `abc`.
pub fn sequence_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

pub fn parse_metadata_file(path: &Path) -> Result<SequenceRecord, ParseError> {
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let sequence_id = sequence_id_from_path(path).ok_or_else(|| ParseError::SequenceId {
        path: path.to_path_buf(),
    })?;
    parse_metadata_str(path, &sequence_id, &text)
}

/// Parses metadata text; `path` is only used for error context.
pub fn parse_metadata_str(
    path: &Path,
    sequence_id: &str,
    text: &str,
) -> Result<SequenceRecord, ParseError> {
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| ParseError::Empty {
        path: path.to_path_buf(),
    })?;
    let video_id = parse_header(header).ok_or_else(|| ParseError::Header {
        path: path.to_path_buf(),
        header: header.to_string(),
    })?;

    let mut timestamps = Vec::new();
    let mut intrinsics = Vec::new();
    let mut poses = Vec::new();

    for (idx, line) in lines.enumerate() {
        // Line numbers are 1-based and count the header.
        let line_no = idx + 2;
        if line.trim().is_empty() {
            continue;
        }
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() != FIELDS_PER_LINE {
            return Err(ParseError::FieldCount {
                path: path.to_path_buf(),
                line: line_no,
                found: fields.len(),
            });
        }

        let number_err = |column: usize| ParseError::Number {
            path: path.to_path_buf(),
            line: line_no,
            column,
            value: fields[column].to_string(),
        };

        timestamps.push(fields[0].parse::<i64>().map_err(|_| number_err(0))?);

        let mut k = [0f32; 4];
        for (j, slot) in k.iter_mut().enumerate() {
            let column = INTRINSICS_AT + j;
            *slot = parse_f32(fields[column]).ok_or_else(|| number_err(column))?;
        }
        intrinsics.push(k);

        let mut pose = [0f32; 12];
        for (j, slot) in pose.iter_mut().enumerate() {
            let column = POSE_AT + j;
            *slot = parse_f32(fields[column]).ok_or_else(|| number_err(column))?;
        }
        poses.push(pose);
    }

    // Lengths are equal by construction.
    Ok(SequenceRecord {
        sequence_id: sequence_id.to_string(),
        video_id,
        timestamps,
        intrinsics,
        poses,
    })
}

fn parse_header(header: &str) -> Option<String> {
    let header = header.trim_end();
    if !header.contains('=') {
        return None;
    }
    let video_id = header.rsplit('=').next()?.trim();
    if video_id.is_empty() {
        None
    } else {
        Some(video_id.to_string())
    }
}

fn parse_f32(field: &str) -> Option<f32> {
    field.parse::<f32>().ok().filter(|v| v.is_finite())
}
