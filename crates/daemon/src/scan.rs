use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup;
use crate::sidecar;

/// Media file extensions the daemon will pick up
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm", "ts"];

/// Result of scanning a file
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    /// File should be queued (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File should be skipped (path, reason)
    Skipped(PathBuf, String),
}

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Scan library roots for media files.
///
/// With a non-zero `settle`, every candidate is stat'ed again after that
/// delay and files whose size changed are reported as still copying.
pub async fn scan_library(roots: &[PathBuf], settle: Duration) -> Result<Vec<ScanResult>> {
    let mut results = Vec::new();
    let mut candidates: Vec<(PathBuf, u64)> = Vec::new();

    for root in roots {
        if !root.exists() {
            warn!("Library root does not exist: {}", root.display());
            continue;
        }

        info!("Scanning directory: {}", root.display());
        let mut media_files_found = 0;

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !is_media_file(path) {
                continue;
            }
            if backup::is_work_file(path) {
                debug!("Ignoring work file: {}", path.display());
                continue;
            }

            media_files_found += 1;

            if sidecar::has_skip_marker(path) {
                results.push(ScanResult::Skipped(
                    path.to_path_buf(),
                    "skip marker (.remuxskip) exists".to_string(),
                ));
                continue;
            }

            let size = std::fs::metadata(path)
                .with_context(|| format!("Failed to stat file: {}", path.display()))?
                .len();
            if size == 0 {
                results.push(ScanResult::Skipped(path.to_path_buf(), "empty file".to_string()));
                continue;
            }
            candidates.push((path.to_path_buf(), size));
        }

        info!(
            "Finished scanning {}: {} media files found",
            root.display(),
            media_files_found
        );
    }

    if !settle.is_zero() && !candidates.is_empty() {
        debug!("Waiting {}s to check {} file(s) for stability", settle.as_secs(), candidates.len());
        tokio::time::sleep(settle).await;
    }

    for (path, size0) in candidates {
        if !settle.is_zero() {
            let size1 = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("File vanished during scan: {}: {}", path.display(), e);
                    continue;
                }
            };
            if size1 != size0 {
                results.push(ScanResult::Skipped(path, "file still copying".to_string()));
                continue;
            }
        }
        debug!("Found candidate: {} ({} bytes)", path.display(), size0);
        results.push(ScanResult::Candidate(path, size0));
    }

    info!(
        "Scan complete: {} candidates, {} skipped",
        results.iter().filter(|r| matches!(r, ScanResult::Candidate(..))).count(),
        results.iter().filter(|r| matches!(r, ScanResult::Skipped(..))).count()
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn candidates(results: &[ScanResult]) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = results
            .iter()
            .filter_map(|r| match r {
                ScanResult::Candidate(p, _) => Some(p.clone()),
                ScanResult::Skipped(..) => None,
            })
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file(Path::new("/a/b.MKV")));
        assert!(is_media_file(Path::new("/a/b.ts")));
        assert!(!is_media_file(Path::new("/a/b.nfo")));
        assert!(!is_media_file(Path::new("/a/b")));
    }

    #[tokio::test]
    async fn test_scan_finds_media_and_honours_markers() {
        let dir = TempDir::new().unwrap();
        let show = dir.path().join("tv/Show/Season 01");
        fs::create_dir_all(&show).unwrap();

        let keep = show.join("e1.mkv");
        let skipped = show.join("e2.mp4");
        fs::write(&keep, b"data").unwrap();
        fs::write(&skipped, b"data").unwrap();
        fs::write(sidecar::skip_marker_path(&skipped), b"").unwrap();
        fs::write(show.join("e1.nfo"), b"<episodedetails/>").unwrap();
        fs::write(show.join("empty.mkv"), b"").unwrap();
        fs::write(backup::temp_output_path(&keep, "job1"), b"partial").unwrap();
        fs::write(backup::backup_path(&keep, "job1"), b"data").unwrap();

        let results = scan_library(&[dir.path().to_path_buf()], Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(candidates(&results), vec![keep]);
        assert!(results.contains(&ScanResult::Skipped(
            skipped,
            "skip marker (.remuxskip) exists".to_string()
        )));
        assert!(results
            .iter()
            .any(|r| matches!(r, ScanResult::Skipped(_, reason) if reason == "empty file")));
    }

    #[tokio::test]
    async fn test_missing_root_is_skipped() {
        let dir = TempDir::new().unwrap();
        let results = scan_library(&[dir.path().join("nope")], Duration::ZERO)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
