//! Adapters for the external collaborators of the download stage: the
//! video fetcher and the tools that retrieve the published list archive.

use crate::progress::ProgressHandle;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

pub const DEFAULT_LIST_SOURCE: &str =
    "https://s3-haosu.nrp-nautilus.io/jet-public/RealEstate10K.tar.gz";
pub const LIST_ARCHIVE_NAME: &str = "RealEstate10K.tar.gz";
pub const LIST_ROOT_NAME: &str = "RealEstate10K";
pub const VIDEO_EXT: &str = "mp4";
pub const WATCH_URL: &str = "https://www.youtube.com/watch?v=";

/// Adaptive 720p mp4 video stream if there is one, otherwise the best
/// single-file stream.
pub const FORMAT_SELECTOR: &str = "bv*[height=720][ext=mp4]/b";
pub const FETCH_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program:?} exited with {status}: {detail}")]
    Failed {
        program: PathBuf,
        status: String,
        detail: String,
    },
    #[error("fetch reported success but {0:?} does not exist")]
    MissingOutput(PathBuf),
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    AlreadyPresent,
    Downloaded,
}

/// Fetches the source video `video_id` into `target`.
pub trait VideoFetcher: Send + Sync {
    fn fetch(&self, video_id: &str, target: &Path) -> Result<(), FetchError>;
}

/// Fetches through a `yt-dlp` compatible command line tool.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: PathBuf,
    retries: u32,
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            retries: FETCH_RETRIES,
        }
    }
}

impl VideoFetcher for YtDlpFetcher {
    fn fetch(&self, video_id: &str, target: &Path) -> Result<(), FetchError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--quiet")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg("--retries")
            .arg(self.retries.to_string())
            .arg("-f")
            .arg(FORMAT_SELECTOR)
            .arg("-o")
            .arg(target)
            .arg(format!("{}{}", WATCH_URL, video_id));
        run_tool(&mut cmd, &self.program)?;

        if !target.is_file() {
            return Err(FetchError::MissingOutput(target.to_path_buf()));
        }
        Ok(())
    }
}

pub fn video_path(raw_dir: &Path, video_id: &str) -> PathBuf {
    raw_dir.join(format!("{}.{}", video_id, VIDEO_EXT))
}

/// Fetches one video unless it is already on disk. A failed fetch leaves no
/// partial file behind.
pub fn fetch_video(
    fetcher: &dyn VideoFetcher,
    video_id: &str,
    raw_dir: &Path,
    progress: &ProgressHandle,
) -> Result<FetchOutcome, FetchError> {
    let target = video_path(raw_dir, video_id);
    if target.exists() {
        progress.log(format!("Skipping, already downloaded: {:?}", target));
        return Ok(FetchOutcome::AlreadyPresent);
    }

    match fetcher.fetch(video_id, &target) {
        Ok(()) => Ok(FetchOutcome::Downloaded),
        Err(err) => {
            for leftover in [target.clone(), partial_path(&target)] {
                if leftover.exists() {
                    if let Err(e) = std::fs::remove_file(&leftover) {
                        progress.error(format!(
                            "cannot remove partial download {:?}: {}",
                            leftover, e
                        ));
                    }
                }
            }
            Err(err)
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Downloads and unpacks the list archive under `lists_dir`, returning the
/// directory holding the `train/` and `test/` lists.
pub fn retrieve_lists(
    source_url: &str,
    lists_dir: &Path,
    downloader: &Path,
    tar: &Path,
    progress: &ProgressHandle,
) -> Result<PathBuf, FetchError> {
    std::fs::create_dir_all(lists_dir).map_err(|source| FetchError::Io {
        op: "create",
        path: lists_dir.to_path_buf(),
        source,
    })?;
    let archive = lists_dir.join(LIST_ARCHIVE_NAME);

    progress.log(format!("Downloading lists from: {}", source_url));
    let mut fetch = Command::new(downloader);
    fetch
        .arg("--fail")
        .arg("--silent")
        .arg("--show-error")
        .arg("--location")
        .arg("--output")
        .arg(&archive)
        .arg(source_url);
    run_tool(&mut fetch, downloader)?;

    let mut unpack = Command::new(tar);
    unpack.arg("-xf").arg(&archive).arg("-C").arg(lists_dir);
    run_tool(&mut unpack, tar)?;

    std::fs::remove_file(&archive).map_err(|source| FetchError::Io {
        op: "remove",
        path: archive.clone(),
        source,
    })?;
    Ok(lists_dir.join(LIST_ROOT_NAME))
}

fn run_tool(cmd: &mut Command, program: &Path) -> Result<(), FetchError> {
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| FetchError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(FetchError::Failed {
            program: program.to_path_buf(),
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::progress::quiet_reporter;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Writes a stub video for every id not in `unavailable`; for those it
    /// leaves a half-written file and fails, like an interrupted transfer.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub calls: AtomicUsize,
        pub unavailable: HashSet<String>,
    }

    impl FakeFetcher {
        pub(crate) fn without(ids: &[&str]) -> Self {
            Self {
                unavailable: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl VideoFetcher for FakeFetcher {
        fn fetch(&self, video_id: &str, target: &Path) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.contains(video_id) {
                std::fs::write(partial_path(target), b"half").expect("write partial");
                return Err(FetchError::Failed {
                    program: PathBuf::from("fake-fetch"),
                    status: "exit status: 1".to_string(),
                    detail: format!("ERROR: [youtube] {video_id}: Video unavailable"),
                });
            }
            std::fs::write(target, b"mp4").expect("write video");
            Ok(())
        }
    }

    #[test]
    fn fetch_skips_existing_video() {
        let tmp = TempDir::new().expect("tempdir");
        let reporter = quiet_reporter("test");
        std::fs::write(tmp.path().join("abc.mp4"), b"already here").expect("write");

        let fetcher = FakeFetcher::default();
        let outcome = fetch_video(&fetcher, "abc", tmp.path(), &reporter.handle()).expect("fetch");
        assert_eq!(outcome, FetchOutcome::AlreadyPresent);
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn fetch_writes_video_named_after_id() {
        let tmp = TempDir::new().expect("tempdir");
        let reporter = quiet_reporter("test");
        let fetcher = FakeFetcher::default();
        let outcome = fetch_video(&fetcher, "xyz", tmp.path(), &reporter.handle()).expect("fetch");
        assert_eq!(outcome, FetchOutcome::Downloaded);
        assert!(tmp.path().join("xyz.mp4").is_file());
    }

    #[test]
    fn failed_fetch_removes_partial_download() {
        let tmp = TempDir::new().expect("tempdir");
        let reporter = quiet_reporter("test");
        let fetcher = FakeFetcher::without(&["gone"]);

        let err = fetch_video(&fetcher, "gone", tmp.path(), &reporter.handle()).unwrap_err();
        assert!(err.to_string().contains("Video unavailable"), "{err}");
        assert!(!tmp.path().join("gone.mp4").exists());
        assert!(!tmp.path().join("gone.mp4.part").exists());
    }

    #[test]
    fn tool_failure_carries_last_stderr_line() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo first >&2; echo 'ERROR: last words' >&2; exit 3");
        let err = run_tool(&mut cmd, Path::new("sh")).unwrap_err();
        match err {
            FetchError::Failed { detail, .. } => assert_eq!(detail, "ERROR: last words"),
            other => panic!("unexpected error: {other}"),
        }

        let mut missing = Command::new("/definitely/not/a/tool");
        assert!(matches!(
            run_tool(&mut missing, Path::new("/definitely/not/a/tool")).unwrap_err(),
            FetchError::Spawn { .. }
        ));
    }
}
