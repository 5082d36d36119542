//! Disk budget for directories of session value logs and event files.

use crate::errors::FuzzError;
use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the oldest files in `dir` (by modification time) until the files
/// left add up to at most `budget_bytes`. `keep` is never deleted, even if it
/// alone exceeds the budget. Returns the deleted paths, oldest first.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    keep: Option<&Path>,
) -> Result<Vec<PathBuf>, FuzzError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| FuzzError::file_access(dir, e))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok().filter(|meta| meta.is_file())?;
            Some((entry.path(), meta.len(), meta.modified().ok()))
        })
        .collect::<Vec<_>>();

    let mut total = files.iter().map(|(_, len, _)| *len).sum::<u64>();
    if total <= budget_bytes {
        return Ok(Vec::new());
    }
    files.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

    let mut deleted = Vec::new();
    for (path, len, _) in files {
        if total <= budget_bytes {
            break;
        }
        if keep.is_some_and(|keep| keep == path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            // Another process pruned it first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FuzzError::file_access(&path, e)),
        }
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::enforce_total_budget;
    use std::fs;

    #[test]
    fn prunes_oldest_files_until_budget_is_met() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.log"), vec![0u8; 40]).expect("a");
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("b.log"), vec![0u8; 40]).expect("b");

        let deleted = enforce_total_budget(dir.path(), 50, None).expect("pruned");
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("a.log"));
        assert!(dir.path().join("b.log").exists());
    }

    #[test]
    fn kept_file_survives_and_under_budget_is_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let current = dir.path().join("current.log");
        fs::write(&current, vec![0u8; 100]).expect("current");

        let deleted = enforce_total_budget(dir.path(), 10, Some(&current)).expect("pruned");
        assert!(deleted.is_empty());
        assert!(current.exists());

        let deleted = enforce_total_budget(dir.path(), 1000, None).expect("noop");
        assert!(deleted.is_empty());
    }
}
