//! Atomic configuration applier — temp-stage, validate, rename.
//!
//! Strategy per bundle:
//!   1. Write every decoded file into a fresh private staging dir (0700).
//!   2. Per file, in bundle order: back up the existing target, then
//!      atomically rename the staged copy into place.
//!   3. On success, drop the staging dir (backups included).
//!   4. On any error, restore every touched target from its backup (or
//!      unlink targets that did not exist) in reverse order.
//!
//! The atomicity grain is the per-file rename; the bundle as a whole is
//! made transactional by compensating rollback against any error the
//! process itself observes.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod bundle;
pub mod path;

use bundle::DecodedFile;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("target {0} exists but is not a regular file")]
    NotRegularFile(PathBuf),
    #[error("apply cancelled before commit")]
    Cancelled,
    /// Rollback itself failed; the original error is preserved, the
    /// rollback failures ride alongside.
    #[error("{original}; rollback also failed: {rollback}")]
    RollbackFailed {
        original: Box<ApplyError>,
        rollback: String,
    },
}

impl ApplyError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> ApplyError {
        let context = context.into();
        move |source| ApplyError::Io { context, source }
    }
}

/// Request-scoped cancellation flag. The applier polls it between staged
/// files; a rename in progress is never interrupted.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Guard that cancels the flag when dropped unless defused. Ties the
    /// flag to a request future: a handler holds the guard across the
    /// blocking apply, so dropping the future (client disconnect) cancels
    /// the staging loop it spawned.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            flag: self.clone(),
            armed: true,
        }
    }
}

pub struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    /// Disarm once the apply has returned.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

/// One journal record: how to undo a single target mutation.
struct JournalEntry {
    target: PathBuf,
    /// `Some` = restore this backup; `None` = the target did not exist.
    backup: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Applier {
    /// Chroot-style prefix applied to every target. Empty = real root.
    root: PathBuf,
    /// Where apply-* staging dirs are created. `None` = system temp dir.
    staging_base: Option<PathBuf>,
}

impl Applier {
    pub fn new(root: PathBuf, staging_base: Option<PathBuf>) -> Self {
        Self { root, staging_base }
    }

    /// Apply a validated bundle. On success returns the number of files
    /// written; on failure the filesystem is restored to its pre-apply
    /// state (modulo the staging directory) before the error returns.
    pub fn apply(&self, files: &[DecodedFile], cancel: &CancelFlag) -> Result<usize, ApplyError> {
        let staging = self.create_staging()?;
        let backup_dir = staging.path().join("backup");

        // Stage everything first; commit only begins once every file is
        // safely on disk in the private directory.
        let mut staged_paths = Vec::with_capacity(files.len());
        for file in files {
            if cancel.is_cancelled() {
                return Err(ApplyError::Cancelled);
            }
            staged_paths.push(self.stage_file(staging.path(), file)?);
        }

        let mut journal: Vec<JournalEntry> = Vec::with_capacity(files.len());
        for (file, staged) in files.iter().zip(&staged_paths) {
            let target = self.resolve_target(&file.target);
            if let Err(err) = self.commit_file(staged, &target, &backup_dir, &mut journal) {
                return Err(self.rollback(journal, err));
            }
        }

        info!(files = files.len(), "Configuration bundle applied");
        // Cleanup failures after a committed apply are log-only.
        if let Err(err) = staging.close() {
            warn!("Failed to remove staging directory: {}", err);
        }
        Ok(files.len())
    }

    fn create_staging(&self) -> Result<tempfile::TempDir, ApplyError> {
        let staging = match &self.staging_base {
            Some(base) => {
                fs::create_dir_all(base)
                    .map_err(ApplyError::io(format!("creating staging base {}", base.display())))?;
                tempfile::Builder::new().prefix("apply-").tempdir_in(base)
            }
            None => tempfile::Builder::new().prefix("apply-").tempdir(),
        }
        .map_err(ApplyError::io("creating staging directory"))?;

        set_mode(staging.path(), 0o700)
            .map_err(ApplyError::io("restricting staging directory"))?;
        Ok(staging)
    }

    /// Write one decoded file into the staging tree with its final mode.
    fn stage_file(&self, staging: &Path, file: &DecodedFile) -> Result<PathBuf, ApplyError> {
        let relative = file.target.trim_start_matches('/');
        let staged = staging.join(relative);
        if let Some(parent) = staged.parent() {
            create_dirs(parent, 0o755)
                .map_err(ApplyError::io(format!("staging dirs for {}", file.relative)))?;
        }

        let mut out = fs::File::create(&staged)
            .map_err(ApplyError::io(format!("staging {}", file.relative)))?;
        out.write_all(&file.content)
            .map_err(ApplyError::io(format!("writing staged {}", file.relative)))?;
        drop(out);
        set_mode(&staged, file.mode)
            .map_err(ApplyError::io(format!("setting mode on {}", file.relative)))?;
        Ok(staged)
    }

    /// Back up the target, then move the staged copy into place. The
    /// journal entry is recorded before the move so a failed rename is
    /// still covered by rollback.
    fn commit_file(
        &self,
        staged: &Path,
        target: &Path,
        backup_dir: &Path,
        journal: &mut Vec<JournalEntry>,
    ) -> Result<(), ApplyError> {
        if let Some(parent) = target.parent() {
            create_dirs(parent, 0o755)
                .map_err(ApplyError::io(format!("creating {}", parent.display())))?;
        }

        let backup = match fs::symlink_metadata(target) {
            Ok(meta) if meta.is_file() => {
                fs::create_dir_all(backup_dir)
                    .map_err(ApplyError::io("creating backup directory"))?;
                let backup_path = unique_backup_path(backup_dir, target);
                fs::copy(target, &backup_path)
                    .map_err(ApplyError::io(format!("backing up {}", target.display())))?;
                Some(backup_path)
            }
            Ok(_) => return Err(ApplyError::NotRegularFile(target.to_path_buf())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(ApplyError::Io {
                    context: format!("inspecting {}", target.display()),
                    source: err,
                })
            }
        };
        journal.push(JournalEntry {
            target: target.to_path_buf(),
            backup,
        });

        match fs::rename(staged, target) {
            Ok(()) => Ok(()),
            // Staging and target on different filesystems: copy + fsync +
            // unlink. Only EXDEV gets this treatment; any other rename
            // error is ambiguous and safer treated as a failure.
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                copy_across_devices(staged, target)
                    .map_err(ApplyError::io(format!("copying to {}", target.display())))
            }
            Err(err) => Err(ApplyError::Io {
                context: format!("renaming into {}", target.display()),
                source: err,
            }),
        }
    }

    /// Undo every journaled mutation in reverse order. Collects all
    /// restore errors; the original apply error is never masked.
    fn rollback(&self, journal: Vec<JournalEntry>, original: ApplyError) -> ApplyError {
        let mut failures = Vec::new();
        for entry in journal.into_iter().rev() {
            let result = match &entry.backup {
                Some(backup) => fs::copy(backup, &entry.target).map(|_| ()),
                None => match fs::remove_file(&entry.target) {
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(err) = result {
                failures.push(format!("{}: {}", entry.target.display(), err));
            }
        }

        if failures.is_empty() {
            warn!("Apply failed; all targets restored");
            original
        } else {
            ApplyError::RollbackFailed {
                original: Box::new(original),
                rollback: failures.join("; "),
            }
        }
    }

    fn resolve_target(&self, absolute: &str) -> PathBuf {
        if self.root.as_os_str().is_empty() {
            PathBuf::from(absolute)
        } else {
            self.root.join(absolute.trim_start_matches('/'))
        }
    }
}

/// Backup path for a target, `<basename>.backup`, disambiguated when two
/// bundle entries share a basename.
fn unique_backup_path(backup_dir: &Path, target: &Path) -> PathBuf {
    let basename = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mut candidate = backup_dir.join(format!("{}.backup", basename));
    let mut counter = 1;
    while candidate.exists() {
        candidate = backup_dir.join(format!("{}.backup.{}", basename, counter));
        counter += 1;
    }
    candidate
}

/// EXDEV fallback: create the target with the source's mode, copy bytes,
/// fsync, then unlink the source.
fn copy_across_devices(src: &Path, dst: &Path) -> io::Result<()> {
    let mode = fs::metadata(src)?.permissions();
    let mut reader = fs::File::open(src)?;
    let mut writer = fs::File::create(dst)?;
    writer.set_permissions(mode)?;
    io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    drop(writer);
    fs::remove_file(src)?;
    Ok(())
}

/// Create missing directories, applying `mode` to each one this call
/// created (pre-existing directories keep their permissions).
fn create_dirs(path: &Path, mode: u32) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        create_dirs(parent, mode)?;
    }
    match fs::create_dir(path) {
        Ok(()) => set_mode(path, mode),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn decoded(target: &str, content: &[u8], mode: u32) -> DecodedFile {
        DecodedFile {
            relative: target.trim_start_matches("/etc/").to_string(),
            target: target.to_string(),
            content: content.to_vec(),
            mode,
        }
    }

    fn applier(root: &tempfile::TempDir) -> Applier {
        Applier::new(root.path().to_path_buf(), None)
    }

    #[test]
    fn test_apply_writes_files_with_modes() {
        let root = tempfile::tempdir().unwrap();
        let files = vec![
            decoded("/etc/test/a.conf", b"AAA", 0o644),
            decoded("/etc/test/sub/b.conf", b"BBB", 0o600),
        ];
        let count = applier(&root).apply(&files, &CancelFlag::new()).unwrap();
        assert_eq!(count, 2);

        let a = root.path().join("etc/test/a.conf");
        assert_eq!(fs::read(&a).unwrap(), b"AAA");
        assert_eq!(fs::metadata(&a).unwrap().permissions().mode() & 0o777, 0o644);

        let b = root.path().join("etc/test/sub/b.conf");
        assert_eq!(fs::read(&b).unwrap(), b"BBB");
        assert_eq!(fs::metadata(&b).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_apply_overwrites_and_cleans_staging() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("etc/test/a.conf");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"old").unwrap();

        let staging_base = tempfile::tempdir().unwrap();
        let applier = Applier::new(
            root.path().to_path_buf(),
            Some(staging_base.path().to_path_buf()),
        );
        let files = vec![decoded("/etc/test/a.conf", b"new", 0o644)];
        applier.apply(&files, &CancelFlag::new()).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        // Staging dir is gone after success.
        assert_eq!(fs::read_dir(staging_base.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rollback_restores_previous_contents() {
        let root = tempfile::tempdir().unwrap();
        let a_target = root.path().join("etc/test/a.conf");
        fs::create_dir_all(a_target.parent().unwrap()).unwrap();
        fs::write(&a_target, b"original-a").unwrap();

        // Second target is a directory, which aborts the apply after the
        // first file has already been renamed into place.
        let b_target = root.path().join("etc/test/b.conf");
        fs::create_dir_all(&b_target).unwrap();

        let files = vec![
            decoded("/etc/test/a.conf", b"new-a", 0o644),
            decoded("/etc/test/b.conf", b"new-b", 0o644),
        ];
        let err = applier(&root)
            .apply(&files, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, ApplyError::NotRegularFile(_)));
        assert_eq!(fs::read(&a_target).unwrap(), b"original-a");
    }

    #[test]
    fn test_rollback_removes_files_that_did_not_exist() {
        let root = tempfile::tempdir().unwrap();
        let b_target = root.path().join("etc/test/b.conf");
        fs::create_dir_all(&b_target).unwrap();

        let a_target = root.path().join("etc/test/a.conf");
        let files = vec![
            decoded("/etc/test/a.conf", b"new-a", 0o644),
            decoded("/etc/test/b.conf", b"new-b", 0o644),
        ];
        applier(&root)
            .apply(&files, &CancelFlag::new())
            .unwrap_err();
        assert!(!a_target.exists());
    }

    #[test]
    fn test_symlink_target_aborts() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("etc/test");
        fs::create_dir_all(&dir).unwrap();
        let real = dir.join("real.conf");
        fs::write(&real, b"x").unwrap();
        std::os::unix::fs::symlink(&real, dir.join("a.conf")).unwrap();

        let files = vec![decoded("/etc/test/a.conf", b"new", 0o644)];
        let err = applier(&root)
            .apply(&files, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, ApplyError::NotRegularFile(_)));
        assert_eq!(fs::read(&real).unwrap(), b"x");
    }

    #[test]
    fn test_drop_guard_cancels_unless_defused() {
        let flag = CancelFlag::new();
        {
            let _guard = flag.drop_guard();
        }
        assert!(flag.is_cancelled());

        let flag = CancelFlag::new();
        flag.drop_guard().defuse();
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_cancellation_before_commit_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let files = vec![decoded("/etc/test/a.conf", b"AAA", 0o644)];
        let err = applier(&root).apply(&files, &cancel).unwrap_err();
        assert!(matches!(err, ApplyError::Cancelled));
        assert!(!root.path().join("etc/test/a.conf").exists());
    }

    #[test]
    fn test_backup_mode_preserved_on_rollback() {
        let root = tempfile::tempdir().unwrap();
        let a_target = root.path().join("etc/test/a.conf");
        fs::create_dir_all(a_target.parent().unwrap()).unwrap();
        fs::write(&a_target, b"original").unwrap();
        set_mode(&a_target, 0o600).unwrap();

        let b_target = root.path().join("etc/test/b.conf");
        fs::create_dir_all(&b_target).unwrap();

        let files = vec![
            decoded("/etc/test/a.conf", b"new", 0o644),
            decoded("/etc/test/b.conf", b"x", 0o644),
        ];
        applier(&root)
            .apply(&files, &CancelFlag::new())
            .unwrap_err();
        assert_eq!(fs::read(&a_target).unwrap(), b"original");
        assert_eq!(
            fs::metadata(&a_target).unwrap().permissions().mode() & 0o777,
            0o600
        );
    }

    #[test]
    fn test_copy_across_devices_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, b"payload").unwrap();
        set_mode(&src, 0o640).unwrap();

        copy_across_devices(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert_eq!(fs::metadata(&dst).unwrap().permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_unique_backup_path_disambiguates() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_backup_path(dir.path(), Path::new("/etc/a/app.conf"));
        fs::write(&first, b"x").unwrap();
        let second = unique_backup_path(dir.path(), Path::new("/etc/b/app.conf"));
        assert_ne!(first, second);
    }
}
