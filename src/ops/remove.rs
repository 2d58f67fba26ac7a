//! Deinstallation task.
//!
//! Removal is the mirror image of the install commit: the document and
//! installation directories are renamed to their `-` siblings first
//! (which is the point of no return), then removed through the
//! privileged helper, and finally the registry drops the package or, for
//! a built-in whose update was removed, reverts to the base manifest.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::io::scope::{sibling, Renames, ScopedRenamer};
use crate::ops::{TaskControl, TaskEnv, TaskEvent, TaskId};
use crate::registry::RegistryClient;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(30);

pub(crate) struct DeinstallationTask {
    pub id: TaskId,
    pub package_id: String,
    pub keep_documents: bool,
    pub env: Arc<TaskEnv>,
    pub control: Arc<TaskControl>,
    pub registry: RegistryClient,
}

impl DeinstallationTask {
    pub async fn run(self) {
        debug!(
            "starting deinstallation task {} for package {}",
            self.id, self.package_id
        );
        self.registry.emit(TaskEvent::Started);

        let mut manager_approved = false;
        match self.execute(&mut manager_approved).await {
            Ok(()) => self.registry.emit(TaskEvent::Finished),
            Err(err) => {
                if manager_approved
                    && self
                        .registry
                        .canceled_package_install(&self.package_id)
                        .await
                        .is_err()
                {
                    warn!(
                        "registry could not re-enable package {} after a failed removal",
                        self.package_id
                    );
                }
                self.registry.emit(TaskEvent::Failed(err));
            }
        }
    }

    async fn execute(&self, manager_approved: &mut bool) -> Result<()> {
        // the registry re-validates and blocks the package for us;
        // things might have changed since the task was queued
        self.registry
            .starting_package_removal(&self.package_id)
            .await?;
        *manager_approved = true;

        // wait until all applications of the package have stopped
        loop {
            if self.control.is_canceled() {
                return Err(Error::Canceled);
            }
            if self.env.probe.all_stopped_for(&self.package_id) {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        self.control.mark_point_of_no_return();
        if self.control.is_canceled() {
            return Err(Error::Canceled);
        }

        let env = self.env.clone();
        let package_id = self.package_id.clone();
        let keep_documents = self.keep_documents;
        tokio::task::spawn_blocking(move || commit_removal(&env, &package_id, keep_documents))
            .await
            .map_err(|e| Error::Internal(format!("removal phase panicked: {e}")))??;

        if self
            .registry
            .finished_package_install(&self.package_id)
            .await
            .is_err()
        {
            warn!(
                "registry did not approve the deinstallation of {}",
                self.package_id
            );
        }
        Ok(())
    }
}

fn commit_removal(env: &TaskEnv, package_id: &str, keep_documents: bool) -> Result<()> {
    let mut document_rename: Option<ScopedRenamer> = None;
    if !keep_documents {
        if let Some(root) = &env.document_dir {
            let document_dir = root.join(package_id);
            if document_dir.exists() {
                document_rename = Some(ScopedRenamer::rename(&document_dir, Renames::BACKUP)?);
            }
        }
    }

    let target = env.installation_dir.join(package_id);
    let mut installation_rename = ScopedRenamer::rename(&target, Renames::BACKUP)?;

    if let Some(rename) = document_rename.as_mut() {
        rename.take();
    }
    installation_rename.take();

    // point of no return: both renames are committed, the `-` siblings
    // are garbage now and failing to delete them is only logged
    let mut leftovers = Vec::new();
    if let Some(rename) = &document_rename {
        if rename.is_renamed() {
            leftovers.push(sibling(rename.base_name(), '-'));
        }
    }
    if installation_rename.is_renamed() {
        leftovers.push(sibling(installation_rename.base_name(), '-'));
    }
    for path in leftovers {
        if let Err(e) = env.remove_recursive(&path) {
            error!("could not remove {}: {e}", path.display());
        }
    }
    Ok(())
}
