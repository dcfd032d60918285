//! Backup-then-commit discipline for in-place file mutation.
//!
//! A job takes one [`BackupGuard`] before its first mutating stage. Each stage
//! writes into a [`StagedOutput`] temp file next to the media file, verifies it,
//! and commits it with a single rename. Rollback re-materialises the backup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::ToolError;

const BACKUP_MARKER: &str = ".remux-backup-";
const TEMP_MARKER: &str = ".remux-tmp-";
const RESTORE_MARKER: &str = ".remux-restore-";
const PARTIAL_MARKER: &str = ".remux-partial-";

fn sibling(file: &Path, name: String) -> PathBuf {
    match file.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn file_name(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `.<name>.remux-backup-<job>` next to the media file.
pub fn backup_path(file: &Path, job_id: &str) -> PathBuf {
    sibling(file, format!(".{}{}{}", file_name(file), BACKUP_MARKER, job_id))
}

/// `.<stem>.remux-tmp-<job>.<ext>` next to the media file.
///
/// The extension is kept so ffmpeg picks the same container muxer.
pub fn temp_output_path(file: &Path, job_id: &str) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match file.extension() {
        Some(ext) => format!(".{}{}{}.{}", stem, TEMP_MARKER, job_id, ext.to_string_lossy()),
        None => format!(".{}{}{}", stem, TEMP_MARKER, job_id),
    };
    sibling(file, name)
}

fn restore_temp_path(file: &Path, job_id: &str) -> PathBuf {
    sibling(file, format!(".{}{}{}", file_name(file), RESTORE_MARKER, job_id))
}

/// Where an in-progress copy for `dst` is written before it is renamed into place.
fn partial_path(dst: &Path) -> PathBuf {
    sibling(dst, format!("{}{}", file_name(dst), PARTIAL_MARKER))
}

/// Backup, temp output, restore-staging or partial copy of some job.
pub fn is_work_file(path: &Path) -> bool {
    let name = file_name(path);
    [BACKUP_MARKER, TEMP_MARKER, RESTORE_MARKER, PARTIAL_MARKER]
        .iter()
        .any(|marker| name.contains(marker))
}

/// Copy `src` to `dst` so that `dst` either does not exist or is complete.
///
/// Bytes go to a partial sibling, are synced, and only then renamed to `dst`.
fn copy_atomically(src: &Path, dst: &Path) -> io::Result<()> {
    let partial = partial_path(dst);
    let result = fs::copy(src, &partial)
        .and_then(|_| fs::File::open(&partial)?.sync_all())
        .and_then(|()| fs::rename(&partial, dst));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

/// Hard link `src` to `dst`, copying when linking is not possible
/// (cross-device, unsupported filesystem).
fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("hard link {} failed ({}), copying", dst.display(), e);
            copy_atomically(src, dst)
        }
    }
}

/// Put the backup back in place of `file` without touching the backup itself.
fn restore_from(backup: &Path, file: &Path, job_id: &str) -> io::Result<()> {
    let staging = restore_temp_path(file, job_id);
    if staging.exists() {
        fs::remove_file(&staging)?;
    }
    link_or_copy(backup, &staging)?;
    fs::rename(&staging, file)
}

/// Restore `file` from the backup of `job_id` if one exists.
///
/// Used by crash recovery, where no guard survives. Returns whether the file
/// was restored. A backup only exists under its final name once complete; an
/// empty one is still never trusted over an existing file.
pub fn restore_if_present(file: &Path, job_id: &str) -> io::Result<bool> {
    let backup = backup_path(file, job_id);
    let len = match fs::metadata(&backup) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if len == 0 && file.exists() {
        warn!(
            "Job {}: ignoring empty backup {}",
            job_id,
            backup.display()
        );
        return Ok(false);
    }
    restore_from(&backup, file, job_id)?;
    Ok(true)
}

/// Scoped ownership of a job's pre-mutation backup.
///
/// Must be ended with [`BackupGuard::discard`] on success or
/// [`BackupGuard::rollback`] on failure. A guard dropped without either
/// restores the file.
#[derive(Debug)]
pub struct BackupGuard {
    file: PathBuf,
    backup: PathBuf,
    job_id: String,
    armed: bool,
}

impl BackupGuard {
    pub fn acquire(file: &Path, job_id: &str) -> io::Result<Self> {
        let backup = backup_path(file, job_id);
        if backup.exists() {
            // Left from an interrupted attempt that recovery already restored.
            fs::remove_file(&backup)?;
        }
        link_or_copy(file, &backup)?;
        debug!("Job {}: backup at {}", job_id, backup.display());
        Ok(Self {
            file: file.to_path_buf(),
            backup,
            job_id: job_id.to_string(),
            armed: true,
        })
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Restore the pre-job file and keep the backup for manual recovery.
    pub fn rollback(mut self) -> io::Result<PathBuf> {
        self.armed = false;
        restore_from(&self.backup, &self.file, &self.job_id)?;
        info!("Job {}: restored {} from backup", self.job_id, self.file.display());
        Ok(self.backup.clone())
    }

    /// The job succeeded; the backup is no longer needed.
    pub fn discard(mut self) -> io::Result<()> {
        self.armed = false;
        match fs::remove_file(&self.backup) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match restore_from(&self.backup, &self.file, &self.job_id) {
            Ok(()) => warn!(
                "Job {}: backup guard dropped without commit, restored {}",
                self.job_id,
                self.file.display()
            ),
            Err(e) => error!(
                "Job {}: failed to restore {} from {}: {}",
                self.job_id,
                self.file.display(),
                self.backup.display(),
                e
            ),
        }
    }
}

/// Temp output for one stage. Dropping it removes any uncommitted temp file.
#[derive(Debug)]
pub struct StagedOutput {
    target: PathBuf,
    temp: PathBuf,
}

impl StagedOutput {
    pub fn new(target: &Path, job_id: &str) -> io::Result<Self> {
        let temp = temp_output_path(target, job_id);
        if temp.exists() {
            fs::remove_file(&temp)?;
        }
        Ok(Self {
            target: target.to_path_buf(),
            temp,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// The tool must have produced a non-empty file.
    pub fn verify(&self) -> Result<u64, ToolError> {
        let meta = match fs::metadata(&self.temp) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ToolError::MissingOutput(self.temp.clone()))
            }
            Err(e) => {
                return Err(ToolError::io(
                    format!("failed to stat {}", self.temp.display()),
                    e,
                ))
            }
        };
        if meta.len() == 0 {
            return Err(ToolError::EmptyOutput(self.temp.clone()));
        }
        Ok(meta.len())
    }

    /// Verify and atomically replace the target. Returns the new size.
    pub fn commit(self) -> Result<u64, ToolError> {
        let size = self.verify()?;
        fs::File::open(&self.temp)
            .and_then(|f| f.sync_all())
            .map_err(|e| ToolError::io(format!("failed to sync {}", self.temp.display()), e))?;
        fs::rename(&self.temp, &self.target).map_err(|e| {
            ToolError::io(
                format!("failed to replace {}", self.target.display()),
                e,
            )
        })?;
        Ok(size)
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if self.temp.exists() {
            if let Err(e) = fs::remove_file(&self.temp) {
                warn!("Failed to remove temp output {}: {}", self.temp.display(), e);
            }
        }
    }
}

/// Delete temp, restore-staging and partial copy files left by crashed runs.
/// Complete backups are never touched.
pub fn sweep_orphans(roots: &[PathBuf]) -> usize {
    let mut removed = 0;
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let orphan = [TEMP_MARKER, RESTORE_MARKER, PARTIAL_MARKER]
                .iter()
                .any(|marker| name.contains(marker));
            if !orphan {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!("Removed orphaned temp file {}", entry.path().display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn media(dir: &TempDir, content: &[u8]) -> PathBuf {
        let path = dir.path().join("Movie (2020).mkv");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_paths_are_hidden_siblings() {
        let file = Path::new("/media/movies/Movie (2020).mkv");
        assert_eq!(
            backup_path(file, "j1"),
            PathBuf::from("/media/movies/.Movie (2020).mkv.remux-backup-j1")
        );
        assert_eq!(
            temp_output_path(file, "j1"),
            PathBuf::from("/media/movies/.Movie (2020).remux-tmp-j1.mkv")
        );
        assert!(is_work_file(&backup_path(file, "j1")));
        assert!(is_work_file(&temp_output_path(file, "j1")));
        assert!(!is_work_file(file));
    }

    #[test]
    fn test_commit_replaces_target() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        let staged = StagedOutput::new(&file, "j1").unwrap();
        fs::write(staged.temp_path(), b"converted").unwrap();
        let size = staged.commit().unwrap();
        assert_eq!(size, 9);
        assert_eq!(fs::read(&file).unwrap(), b"converted");
        assert!(!temp_output_path(&file, "j1").exists());
    }

    #[test]
    fn test_empty_output_is_rejected_and_cleaned() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        let staged = StagedOutput::new(&file, "j1").unwrap();
        fs::write(staged.temp_path(), b"").unwrap();
        assert!(matches!(staged.commit(), Err(ToolError::EmptyOutput(_))));
        assert_eq!(fs::read(&file).unwrap(), b"original");
        assert!(!temp_output_path(&file, "j1").exists());
    }

    #[test]
    fn test_missing_output_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        let staged = StagedOutput::new(&file, "j1").unwrap();
        assert!(matches!(staged.verify(), Err(ToolError::MissingOutput(_))));
    }

    #[test]
    fn test_rollback_restores_and_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original bytes");
        let guard = BackupGuard::acquire(&file, "j1").unwrap();

        let staged = StagedOutput::new(&file, "j1").unwrap();
        fs::write(staged.temp_path(), b"stage one output").unwrap();
        staged.commit().unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"stage one output");

        let kept = guard.rollback().unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"original bytes");
        assert_eq!(fs::read(&kept).unwrap(), b"original bytes");
    }

    #[test]
    fn test_discard_removes_backup() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        let guard = BackupGuard::acquire(&file, "j1").unwrap();
        let backup = guard.backup_path().to_path_buf();
        guard.discard().unwrap();
        assert!(!backup.exists());
        assert_eq!(fs::read(&file).unwrap(), b"original");
    }

    #[test]
    fn test_dropped_guard_restores() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        {
            let _guard = BackupGuard::acquire(&file, "j1").unwrap();
            let staged = StagedOutput::new(&file, "j1").unwrap();
            fs::write(staged.temp_path(), b"half done").unwrap();
            staged.commit().unwrap();
        }
        assert_eq!(fs::read(&file).unwrap(), b"original");
    }

    #[test]
    fn test_restore_if_present() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        assert!(!restore_if_present(&file, "j1").unwrap());

        let guard = BackupGuard::acquire(&file, "j1").unwrap();
        let staged = StagedOutput::new(&file, "j1").unwrap();
        fs::write(staged.temp_path(), b"half done").unwrap();
        staged.commit().unwrap();
        // Simulate a crash: the guard never runs.
        std::mem::forget(guard);
        assert!(restore_if_present(&file, "j1").unwrap());
        assert_eq!(fs::read(&file).unwrap(), b"original");
    }

    #[test]
    fn test_copy_fallback_lands_complete() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original bytes");
        let dst = backup_path(&file, "j1");
        copy_atomically(&file, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"original bytes");
        assert!(!partial_path(&dst).exists());
    }

    #[test]
    fn test_interrupted_backup_copy_never_restored() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original bytes");
        // A crash mid-copy leaves only the partial sibling behind.
        let partial = partial_path(&backup_path(&file, "j1"));
        fs::write(&partial, b"orig").unwrap();
        assert!(is_work_file(&partial));

        assert!(!restore_if_present(&file, "j1").unwrap());
        assert_eq!(fs::read(&file).unwrap(), b"original bytes");

        assert_eq!(sweep_orphans(&[dir.path().to_path_buf()]), 1);
        assert!(!partial.exists());
        assert!(file.exists());
    }

    #[test]
    fn test_empty_backup_is_not_trusted() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original bytes");
        fs::write(backup_path(&file, "j1"), b"").unwrap();
        assert!(!restore_if_present(&file, "j1").unwrap());
        assert_eq!(fs::read(&file).unwrap(), b"original bytes");
    }

    #[test]
    fn test_sweep_removes_temp_but_not_backups() {
        let dir = TempDir::new().unwrap();
        let file = media(&dir, b"original");
        let temp = temp_output_path(&file, "j1");
        let backup = backup_path(&file, "j2");
        fs::write(&temp, b"partial").unwrap();
        fs::write(&backup, b"original").unwrap();

        let removed = sweep_orphans(&[dir.path().to_path_buf()]);
        assert_eq!(removed, 1);
        assert!(!temp.exists());
        assert!(backup.exists());
        assert!(file.exists());
    }
}
