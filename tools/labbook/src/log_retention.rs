use crate::errors::LabError;
use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the oldest files in `dir` until their total size fits `budget_bytes`.
/// `keep` (the file currently being written) is never deleted.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    keep: Option<&Path>,
) -> Result<Vec<PathBuf>, LabError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| LabError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();

    files.sort_by(|a, b| {
        let ma = fs::metadata(a).ok().and_then(|m| m.modified().ok());
        let mb = fs::metadata(b).ok().and_then(|m| m.modified().ok());
        ma.cmp(&mb)
    });

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        if keep.is_some_and(|keep| keep == path) {
            continue;
        }
        let len = fs::metadata(&path)
            .map_err(|e| LabError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| LabError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}
