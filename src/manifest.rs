use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Per-stage list of eligible sequences, `<sequence_id> <video_id>` per line.
pub const SEQUENCE_LIST: &str = "full_list.txt";
/// Absolute paths of exported scene files, one per line.
pub const EXPORT_MANIFEST: &str = "manifest.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub sequence_id: String,
    pub video_id: String,
}

impl ManifestEntry {
    pub fn new(sequence_id: impl Into<String>, video_id: impl Into<String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            video_id: video_id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read manifest {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write manifest {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?}:{line}: expected `<sequence_id> <video_id>`, got {text:?}")]
    Malformed {
        path: PathBuf,
        line: usize,
        text: String,
    },
}

/// Reads a sequence list. Blank lines are skipped and a repeated sequence
/// id keeps its first entry, so every sequence maps to one output path.
pub fn read_sequence_list(path: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        match fields.as_slice() {
            [] => continue,
            [seq, vid] => {
                if seen.insert(seq.to_string()) {
                    entries.push(ManifestEntry::new(*seq, *vid));
                }
            }
            _ => {
                return Err(ManifestError::Malformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    text: line.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

pub fn write_sequence_list(path: &Path, entries: &[ManifestEntry]) -> Result<(), ManifestError> {
    let body = entries
        .iter()
        .map(|e| format!("{} {}\n", e.sequence_id, e.video_id))
        .collect::<String>();
    write_atomically(path, body.as_bytes())
}

pub fn write_path_list(path: &Path, paths: &[PathBuf]) -> Result<(), ManifestError> {
    let body = paths
        .iter()
        .map(|p| format!("{}\n", p.display()))
        .collect::<String>();
    write_atomically(path, body.as_bytes())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let write_err = |source| ManifestError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = std::fs::File::create(&tmp).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(write_err)
}
