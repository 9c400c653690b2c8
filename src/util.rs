use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

/// Fails unless `program` runs and exits cleanly with `version_arg`.
pub fn ensure_tool_available(program: &Path, version_arg: &str) -> Result<()> {
    let out = Command::new(program)
        .arg(version_arg)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {} {}", program.display(), version_arg))?;
    if !out.status.success() {
        bail!(
            "{} exists but returned non-zero on {}",
            program.display(),
            version_arg
        );
    }
    Ok(())
}

pub fn ensure_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_dir() {
        bail!("{} directory not found: {:?}", what, path);
    }
    Ok(())
}

pub fn ensure_file(path: &Path, what: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{} not found: {:?}", what, path);
    }
    Ok(())
}

pub fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("cannot resolve absolute path of {:?}", path))
}

/// Files directly inside `dir` with extension `ext` (case-insensitive), sorted.
pub fn list_files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut v = vec![];
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let e = entry.with_context(|| format!("failed to list {:?}", dir))?;
        if !e.file_type().is_file() {
            continue;
        }
        let p = e.path();
        if let Some(found) = p.extension() {
            if found.to_string_lossy().eq_ignore_ascii_case(ext) {
                v.push(p.to_path_buf());
            }
        }
    }
    v.sort();
    Ok(v)
}
