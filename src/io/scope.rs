//! Scoped filesystem operations with rollback-on-drop.
//!
//! Installation and removal mutate the installation directory through
//! sibling renames (`<id>+` is a pending install, `<id>-` a backup).
//! These guards perform the mutations up front and reverse every
//! completed step on drop unless [`take`](ScopedRenamer::take) committed
//! them.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::error::{Error, Result};

/// Appends a raw suffix character to the last path component.
pub fn sibling(path: &Path, suffix: char) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix.to_string());
    path.with_file_name(name)
}

/// Creates a directory and removes it again on drop unless taken.
#[derive(Debug)]
pub struct ScopedDirectoryCreator {
    path: PathBuf,
    created: bool,
    taken: bool,
}

impl ScopedDirectoryCreator {
    /// Creates `path` (and missing parents). With `replace_existing`,
    /// an existing directory is removed first; otherwise it is adopted
    /// as-is.
    pub fn create(path: impl Into<PathBuf>, replace_existing: bool) -> Result<Self> {
        let path = path.into();

        if path.is_dir() {
            if !replace_existing {
                return Ok(Self {
                    path,
                    created: true,
                    taken: false,
                });
            }
            fs::remove_dir_all(&path)
                .map_err(|e| Error::io_context(format!("cannot replace {}", path.display()), e))?;
        }

        fs::create_dir_all(&path)
            .map_err(|e| Error::io_context(format!("cannot create {}", path.display()), e))?;
        Ok(Self {
            path,
            created: true,
            taken: false,
        })
    }

    /// Takes ownership of a directory that already exists, so it gets
    /// removed on drop unless taken.
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: true,
            taken: false,
        }
    }

    /// Commits the creation; the destructor becomes a no-op.
    pub fn take(&mut self) {
        self.taken = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedDirectoryCreator {
    fn drop(&mut self) {
        if self.created && !self.taken {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                warn!("could not roll back creation of {}: {e}", self.path.display());
            }
        }
    }
}

/// The rename operations a [`ScopedRenamer`] can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renames {
    /// `base` -> `base-`
    pub backup: bool,
    /// `base+` -> `base`
    pub promote: bool,
}

impl Renames {
    pub const BACKUP: Self = Self {
        backup: true,
        promote: false,
    };
    pub const PROMOTE: Self = Self {
        backup: false,
        promote: true,
    };
    pub const BACKUP_AND_PROMOTE: Self = Self {
        backup: true,
        promote: true,
    };
}

/// Carries out up to two sibling renames, in order, and reverses the
/// completed ones in reverse order on drop unless taken.
///
/// If both are requested, *backup* runs first and *promote* only runs
/// if it succeeded; a failed *promote* undoes the backup immediately.
/// On success the final state is reached; on failure either the
/// original state is intact or a `-` backup remains (which is logged).
#[derive(Debug)]
pub struct ScopedRenamer {
    base: PathBuf,
    done_backup: bool,
    done_promote: bool,
    requested: Renames,
    taken: bool,
}

impl ScopedRenamer {
    /// Performs the requested renames on `base` right away.
    pub fn rename(base: impl Into<PathBuf>, requested: Renames) -> Result<Self> {
        let base = base.into();
        let mut this = Self {
            base,
            done_backup: false,
            done_promote: false,
            requested,
            taken: false,
        };

        if requested.backup {
            internal_rename(&this.base, &sibling(&this.base, '-'))?;
            this.done_backup = true;
        }
        if requested.promote {
            if let Err(e) = internal_rename(&sibling(&this.base, '+'), &this.base) {
                // put the backup back before reporting the failure
                this.undo();
                return Err(e);
            }
            this.done_promote = true;
        }
        Ok(this)
    }

    /// Commits all completed renames; the destructor becomes a no-op.
    pub fn take(&mut self) {
        self.taken = true;
    }

    /// Whether every requested rename has been carried out.
    pub fn is_renamed(&self) -> bool {
        (self.requested.backup == self.done_backup)
            && (self.requested.promote == self.done_promote)
            && (self.requested.backup || self.requested.promote)
    }

    pub fn base_name(&self) -> &Path {
        &self.base
    }

    fn undo(&mut self) {
        if self.done_promote {
            match internal_rename(&self.base, &sibling(&self.base, '+')) {
                Ok(()) => self.done_promote = false,
                Err(e) => error!(
                    "failed to undo rename from '{0}+' to '{0}': {e}",
                    self.base.display()
                ),
            }
        }
        if self.done_backup {
            match internal_rename(&sibling(&self.base, '-'), &self.base) {
                Ok(()) => self.done_backup = false,
                Err(e) => error!(
                    "failed to undo rename from '{0}' to '{0}-': {e}",
                    self.base.display()
                ),
            }
        }
    }
}

impl Drop for ScopedRenamer {
    fn drop(&mut self) {
        if !self.taken {
            self.undo();
        }
    }
}

/// Renames `from` to `to`.
///
/// POSIX cannot atomically rename a directory over an existing
/// non-empty directory, so an existing destination directory is removed
/// first. Callers must treat the pair as best-effort atomic.
fn internal_rename(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() && to.exists() {
        fs::remove_dir_all(to)
            .map_err(|e| Error::io_context(format!("cannot remove {}", to.display()), e))?;
    }
    fs::rename(from, to).map_err(|e| {
        Error::io_context(
            format!("cannot rename {} to {}", from.display(), to.display()),
            e,
        )
    })
}
