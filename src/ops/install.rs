//! Installation task.
//!
//! Overview of what happens on an installation of a package `<id>`:
//!
//! 1. extract the archive into a scratch directory next to the final
//!    location, checking that `info.yaml` comes first and the icon
//!    second, and verifying the streamed digest against the footer
//! 2. verify the developer/store signature over the digest
//! 3. hand the parsed manifest to the registry, which registers a new
//!    blocked package (install) or blocks the existing one (update)
//! 4. wait until every application of the package has stopped
//! 5. block in `AwaitingAcknowledge` until the controller acknowledges
//!    or cancels
//! 6. commit, serialized across all installation tasks:
//!    rename scratch to `<id>+`, write the installation report, create
//!    the document directory, re-own the tree when uid separation is
//!    on, then `<id>+` -> `<id>` (backing up `<id>` to `<id>-` on
//!    updates), and finally sweep leftovers and sync
//! 7. tell the registry to swap manifests and unblock the package

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::manifest::{PackageInfo, MANIFEST_NAME};
use crate::core::report::{InstallationReport, REPORT_NAME};
use crate::core::signature;
use crate::error::{Error, Result};
use crate::io::extract::{PackageExtractor, PackageSource};
use crate::io::format::MAX_ICON_SIZE;
use crate::io::scope::{sibling, Renames, ScopedDirectoryCreator, ScopedRenamer};
use crate::ops::{TaskControl, TaskEnv, TaskEvent, TaskId, TaskState};
use crate::registry::RegistryClient;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(30);

pub(crate) struct InstallationTask {
    pub id: TaskId,
    pub source: PackageSource,
    pub env: Arc<TaskEnv>,
    pub control: Arc<TaskControl>,
    pub registry: RegistryClient,
}

#[derive(Default)]
struct InstallProgress {
    package_id: Option<String>,
    manager_approved: bool,
}

impl InstallationTask {
    pub async fn run(self) {
        debug!("starting installation task {}", self.id);
        self.registry.emit(TaskEvent::Started);

        let mut progress = InstallProgress::default();
        match self.execute(&mut progress).await {
            Ok(()) => self.registry.emit(TaskEvent::Finished),
            Err(err) => {
                if progress.manager_approved {
                    if let Some(id) = &progress.package_id {
                        if self.registry.canceled_package_install(id).await.is_err() {
                            warn!(
                                "registry could not remove package {id} after a failed installation"
                            );
                        }
                    }
                }
                self.registry.emit(TaskEvent::Failed(err));
            }
        }
    }

    async fn execute(&self, progress: &mut InstallProgress) -> Result<()> {
        // scratch lives inside the installation dir, so the final
        // rename stays on one filesystem
        let scratch = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(&self.env.installation_dir)
            .map_err(|e| Error::io_context("cannot create a temporary extraction directory", e))?;

        if self.control.is_canceled() {
            return Err(Error::Canceled);
        }

        let mut extractor = PackageExtractor::new(self.source.clone(), scratch.path());
        extractor.use_cancel_handle(&self.control.cancel);
        extractor.set_progress_callback({
            let registry = self.registry.clone();
            move |value| registry.emit(TaskEvent::Progress(value))
        });

        let mut manifest: Option<PackageInfo> = None;
        let report = extractor
            .extract(|index, name, path| check_extracted_file(index, name, path, &mut manifest))
            .await?;

        let manifest = manifest.ok_or_else(|| {
            Error::Package("package did not contain a valid info.yaml and icon file".into())
        })?;
        if manifest.id != report.package_id {
            return Err(Error::Package(
                "the package identifiers in --PACKAGE-HEADER-- and info.yaml do not match".into(),
            ));
        }
        progress.package_id = Some(manifest.id.clone());

        self.verify_signature(&report)?;

        // the next queued task may start now; the commit below is
        // serialized through the commit mutex instead
        self.registry.emit(TaskEvent::ExtractionFinished);

        let uid = self
            .registry
            .starting_package_installation(manifest.clone())
            .await?;
        progress.manager_approved = true;

        // if any applications of this package were running before, wait
        // until all of them have actually stopped
        loop {
            if self.control.is_canceled() {
                return Err(Error::Canceled);
            }
            if self.env.probe.all_stopped_for(&manifest.id) {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        self.registry
            .emit(TaskEvent::StateChanged(TaskState::AwaitingAcknowledge));
        self.registry.emit(TaskEvent::AcknowledgeRequested {
            extra_metadata: report.extra_metadata.clone(),
            extra_signed_metadata: report.extra_signed_metadata.clone(),
        });

        // last cancellation point
        self.control.ack.wait().await?;

        self.registry
            .emit(TaskEvent::StateChanged(TaskState::Installing));

        let _commit_guard = self.env.commit_lock.lock().await;
        {
            let env = self.env.clone();
            let registry = self.registry.clone();
            let id = manifest.id.clone();
            let scratch_path = scratch.path().to_path_buf();
            let report = report.clone();
            tokio::task::spawn_blocking(move || {
                commit_installation(&env, &registry, &id, &scratch_path, &report, uid)
            })
            .await
            .map_err(|e| Error::Internal(format!("commit phase panicked: {e}")))??;
        }

        // the installation is done; a rejection here only gets logged
        if self.registry.finished_package_install(&manifest.id).await.is_err() {
            warn!("registry rejected the installation of {}", manifest.id);
        }
        Ok(())
    }

    /// §signature policy: store signatures take precedence, developer
    /// signatures need development mode, unsigned packages need the
    /// explicit allow-unsigned switch.
    fn verify_signature(&self, report: &InstallationReport) -> Result<()> {
        if self.env.allow_unsigned {
            return Ok(());
        }

        if let Some(sig) = &report.store_signature {
            let message = match &self.env.hardware_id {
                Some(hardware_id) => signature::store_digest(&report.digest, hardware_id),
                None => report.digest.clone(),
            };
            signature::verify(&message, sig, &self.env.chain_of_trust).map_err(|_| {
                Error::SignatureInvalid("could not verify the package's store signature".into())
            })
        } else if let Some(sig) = &report.developer_signature {
            if !self.env.development_mode {
                return Err(Error::SignatureInvalid(
                    "cannot install development packages on consumer devices".into(),
                ));
            }
            signature::verify(&report.digest, sig, &self.env.chain_of_trust).map_err(|_| {
                Error::SignatureInvalid("could not verify the package's developer signature".into())
            })
        } else {
            Err(Error::UnsignedNotAllowed)
        }
    }
}

/// Per-file contract of the archive: manifest first, then the icon it
/// names (capped at 256 KiB), then arbitrary payload.
fn check_extracted_file(
    index: usize,
    name: &str,
    path: &Path,
    manifest: &mut Option<PackageInfo>,
) -> Result<()> {
    match index {
        0 => {
            if name != MANIFEST_NAME {
                return Err(Error::Package(format!(
                    "info.yaml must be the first file in the package, got '{name}'"
                )));
            }
            *manifest = Some(PackageInfo::load_file(path)?);
            Ok(())
        }
        1 => {
            let info = manifest
                .as_ref()
                .ok_or_else(|| Error::Internal("icon extracted before the manifest".into()))?;
            if name != info.icon {
                return Err(Error::Package(format!(
                    "the package icon (as stated in info.yaml) must be the second file in the \
                     package, expected '{}', got '{name}'",
                    info.icon
                )));
            }
            let size = path
                .metadata()
                .map_err(|e| Error::io_context(format!("cannot stat {}", path.display()), e))?
                .len();
            if size > MAX_ICON_SIZE {
                return Err(Error::Package(format!(
                    "the size of {name} is too large (max. 256KB)"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The serialized tail of the install: from renaming the scratch
/// directory to recording success. All fallible operations run before
/// the final rename; everything after it only logs.
fn commit_installation(
    env: &TaskEnv,
    registry: &RegistryClient,
    package_id: &str,
    scratch: &Path,
    report: &InstallationReport,
    uid: Option<u32>,
) -> Result<()> {
    let target = env.installation_dir.join(package_id);
    let plus_dir = sibling(&target, '+');
    let is_update = target.is_dir();

    // delete an old, partial installation
    if plus_dir.exists() {
        env.remove_recursive(&plus_dir).map_err(|e| {
            Error::Filesystem(format!(
                "could not remove old, partial installation {}: {e}",
                plus_dir.display()
            ))
        })?;
    }

    std::fs::rename(scratch, &plus_dir).map_err(|e| {
        Error::io_context(
            format!(
                "cannot move extraction directory to {}",
                plus_dir.display()
            ),
            e,
        )
    })?;
    let mut plus_guard = ScopedDirectoryCreator::adopt(&plus_dir);

    let report_path = plus_dir.join(REPORT_NAME);
    std::fs::write(&report_path, report.serialize()?)
        .map_err(|e| Error::io_context("could not write the installation report", e))?;

    // create the document directory when installing (not needed on
    // updates, and an earlier install may have left one behind)
    let mut document_guard: Option<ScopedDirectoryCreator> = None;
    let document_dir = env.document_dir.as_ref().map(|root| root.join(package_id));
    if !is_update {
        if let Some(dir) = &document_dir {
            if !dir.is_dir() {
                document_guard = Some(ScopedDirectoryCreator::create(dir, false)?);
            }
        }
    }

    if let Some(range) = env.uid_separation {
        let uid =
            uid.ok_or_else(|| Error::Internal("no application uid was assigned".into()))?;
        if let Some(dir) = &document_dir {
            env.helper
                .set_owner_and_permissions_recursive(dir, uid, range.common_gid, 0o2700)?;
        }
        env.helper
            .set_owner_and_permissions_recursive(&plus_dir, uid, range.common_gid, 0o440)?;
    }

    let renames = if is_update {
        Renames::BACKUP_AND_PROMOTE
    } else {
        Renames::PROMOTE
    };
    let mut renamer = ScopedRenamer::rename(&target, renames)?;

    // from this point onwards we are not allowed to fail anymore,
    // since the installation is "done"
    registry.emit(TaskEvent::StateChanged(TaskState::CleaningUp));

    renamer.take();
    plus_guard.take();
    if let Some(guard) = document_guard.as_mut() {
        guard.take();
    }

    if is_update {
        let backup = sibling(&target, '-');
        if let Err(e) = env.remove_recursive(&backup) {
            warn!("could not remove update leftover {}: {e}", backup.display());
        }
    }

    sync_filesystem();
    Ok(())
}

fn sync_filesystem() {
    #[cfg(unix)]
    // SAFETY: sync() takes no arguments and cannot fail
    unsafe {
        libc::sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn manifest() -> PackageInfo {
        PackageInfo {
            id: "com.pelagicore.test".into(),
            version: "1.0".into(),
            name: BTreeMap::new(),
            description: BTreeMap::new(),
            icon: "icon.png".into(),
            categories: vec![],
            applications: vec![],
            intents: vec![],
        }
    }

    #[test]
    fn test_first_file_must_be_manifest() {
        let mut found = None;
        let err =
            check_extracted_file(0, "icon.png", Path::new("/nonexistent"), &mut found).unwrap_err();
        assert!(err.to_string().contains("info.yaml must be the first file"));
    }

    #[test]
    fn test_second_file_must_match_icon() {
        let mut found = Some(manifest());
        let err =
            check_extracted_file(1, "other.png", Path::new("/nonexistent"), &mut found).unwrap_err();
        assert!(err.to_string().contains("must be the second file"));
    }

    #[test]
    fn test_icon_size_limit() {
        let dir = tempdir().unwrap();
        let icon = dir.path().join("icon.png");
        std::fs::write(&icon, vec![0u8; (MAX_ICON_SIZE + 1) as usize]).unwrap();

        let mut found = Some(manifest());
        let err = check_extracted_file(1, "icon.png", &icon, &mut found).unwrap_err();
        assert!(err.to_string().contains("too large"));

        std::fs::write(&icon, b"small").unwrap();
        check_extracted_file(1, "icon.png", &icon, &mut found).unwrap();
    }

    #[test]
    fn test_payload_files_are_not_checked() {
        let mut found = Some(manifest());
        check_extracted_file(2, "anything", Path::new("/nonexistent"), &mut found).unwrap();
    }
}
