//! The package registry.
//!
//! The registry is the authoritative in-memory model of every package,
//! built-in and installed, and the engine that mutates that state. It
//! runs as a single event loop task owning all `Package` objects;
//! [`PackageManager`] is the cloneable handle whose operations cross
//! into the loop as messages, preserving a single-writer invariant
//! without any global state. Mutating operations are queued: at most
//! one task runs its pre-acknowledge phase at a time, while tasks past
//! acknowledge finalize concurrently under the commit mutex.

pub mod database;
pub mod events;
pub mod model;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::manifest::{PackageInfo, MANIFEST_NAME};
use crate::core::report::{InstallationReport, MetaMap, REPORT_NAME};
use crate::error::{Error, Result};
use crate::io::extract::PackageSource;
use crate::io::privileged::remove_path_recursive;
use crate::ops::install::InstallationTask;
use crate::ops::remove::DeinstallationTask;
use crate::ops::{next_task_id, TaskControl, TaskEnv, TaskEvent, TaskId, TaskState};

pub use events::Notification;
pub use model::{PackageSnapshot, PackageState};

use database::PackageSeed;
use model::{Package, RegisteredInfo};

/// Capacity of the notification broadcast channel; slow subscribers
/// lose the oldest notifications first.
const NOTIFICATION_CAPACITY: usize = 256;

pub(crate) enum Command {
    StartPackageInstallation {
        source: String,
        resp: oneshot::Sender<TaskId>,
    },
    AcknowledgePackageInstallation {
        task: TaskId,
    },
    RemovePackage {
        package_id: String,
        keep_documents: bool,
        resp: oneshot::Sender<Result<TaskId>>,
    },
    CancelTask {
        task: TaskId,
        resp: oneshot::Sender<bool>,
    },
    TaskState {
        task: TaskId,
        resp: oneshot::Sender<Option<TaskState>>,
    },
    TaskPackageId {
        task: TaskId,
        resp: oneshot::Sender<Option<String>>,
    },
    ActiveTaskIds {
        resp: oneshot::Sender<Vec<TaskId>>,
    },
    Packages {
        resp: oneshot::Sender<Vec<PackageSnapshot>>,
    },
    Package {
        package_id: String,
        resp: oneshot::Sender<Option<PackageSnapshot>>,
    },
    InstalledPackageSize {
        package_id: String,
        resp: oneshot::Sender<Option<u64>>,
    },
    InstalledPackageExtraMetadata {
        package_id: String,
        resp: oneshot::Sender<Option<MetaMap>>,
    },
    InstalledPackageExtraSignedMetadata {
        package_id: String,
        resp: oneshot::Sender<Option<MetaMap>>,
    },
    Task {
        task: TaskId,
        event: TaskEvent,
    },
    StartingPackageInstallation {
        task: TaskId,
        info: Box<PackageInfo>,
        resp: oneshot::Sender<Result<Option<u32>>>,
    },
    StartingPackageRemoval {
        task: TaskId,
        package_id: String,
        resp: oneshot::Sender<Result<()>>,
    },
    FinishedPackageInstall {
        package_id: String,
        resp: oneshot::Sender<Result<()>>,
    },
    CanceledPackageInstall {
        package_id: String,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// A task's channel back into the registry event loop.
#[derive(Clone)]
pub(crate) struct RegistryClient {
    task: TaskId,
    tx: mpsc::UnboundedSender<Command>,
}

impl RegistryClient {
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.tx.send(Command::Task {
            task: self.task.clone(),
            event,
        });
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| Error::Internal("registry event loop terminated".into()))?;
        rx.await
            .map_err(|_| Error::Internal("registry event loop terminated".into()))
    }

    /// Transfers the parsed manifest to the registry; on success the
    /// package is registered (or blocked, for updates) and the assigned
    /// application uid is returned.
    pub async fn starting_package_installation(&self, info: PackageInfo) -> Result<Option<u32>> {
        let task = self.task.clone();
        self.request(|resp| Command::StartingPackageInstallation {
            task,
            info: Box::new(info),
            resp,
        })
        .await?
    }

    pub async fn starting_package_removal(&self, package_id: &str) -> Result<()> {
        let task = self.task.clone();
        let package_id = package_id.to_string();
        self.request(|resp| Command::StartingPackageRemoval {
            task,
            package_id,
            resp,
        })
        .await?
    }

    pub async fn finished_package_install(&self, package_id: &str) -> Result<()> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::FinishedPackageInstall { package_id, resp })
            .await?
    }

    pub async fn canceled_package_install(&self, package_id: &str) -> Result<()> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::CanceledPackageInstall { package_id, resp })
            .await?
    }
}

/// Handle to the package registry.
///
/// Cheap to clone; every clone talks to the same event loop, which
/// lives for the rest of the process.
#[derive(Clone)]
pub struct PackageManager {
    tx: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl PackageManager {
    /// Scans the package databases, removes broken installations and
    /// starts the registry event loop.
    pub async fn new(config: Config) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let registry = {
            let tx = tx.clone();
            let notifications = notifications.clone();
            tokio::task::spawn_blocking(move || -> Result<Registry> {
                std::fs::create_dir_all(&config.installation_dir).map_err(|e| {
                    Error::io_context(
                        format!("cannot create {}", config.installation_dir.display()),
                        e,
                    )
                })?;
                if let Some(document_dir) = &config.document_dir {
                    std::fs::create_dir_all(document_dir).map_err(|e| {
                        Error::io_context(format!("cannot create {}", document_dir.display()), e)
                    })?;
                }

                let seeds = database::scan(&config)?;
                let mut registry = Registry::new(config, tx, notifications);
                for seed in seeds {
                    registry.register_seed(seed);
                }
                registry.cleanup_broken_installations()?;
                Ok(registry)
            })
            .await
            .map_err(|e| Error::Internal(format!("registry startup panicked: {e}")))??
        };

        tokio::spawn(registry.run(rx));
        Ok(Self { tx, notifications })
    }

    /// Stream of registry notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| Error::Internal("registry event loop terminated".into()))?;
        rx.await
            .map_err(|_| Error::Internal("registry event loop terminated".into()))
    }

    /// Queues the installation of the package at `source_url` (a local
    /// path, `file://` or `http(s)://` URL) and returns the task id.
    ///
    /// The installation does not complete on its own: once the task
    /// emits [`Notification::TaskRequestingInstallationAcknowledge`],
    /// either [`acknowledge_package_installation`](Self::acknowledge_package_installation)
    /// or [`cancel_task`](Self::cancel_task) must be called.
    pub async fn start_package_installation(&self, source_url: &str) -> Result<TaskId> {
        let source = source_url.to_string();
        self.request(|resp| Command::StartPackageInstallation { source, resp })
            .await
    }

    /// Lets the installation task identified by `task_id` proceed past
    /// `AwaitingAcknowledge`. Unknown or non-installation tasks are
    /// ignored.
    pub async fn acknowledge_package_installation(&self, task_id: &str) -> Result<()> {
        self.tx
            .send(Command::AcknowledgePackageInstallation {
                task: task_id.to_string(),
            })
            .map_err(|_| Error::Internal("registry event loop terminated".into()))
    }

    /// Queues the removal of an installed package. `force` is accepted
    /// for interface compatibility and currently ignored.
    pub async fn remove_package(
        &self,
        package_id: &str,
        keep_documents: bool,
        _force: bool,
    ) -> Result<TaskId> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::RemovePackage {
            package_id,
            keep_documents,
            resp,
        })
        .await?
    }

    /// Tries to cancel the task; returns whether the task may still
    /// fail with `Canceled` (`false` once it is past its point of no
    /// return, finished, or unknown).
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let task = task_id.to_string();
        self.request(|resp| Command::CancelTask { task, resp }).await
    }

    pub async fn task_state(&self, task_id: &str) -> Result<Option<TaskState>> {
        let task = task_id.to_string();
        self.request(|resp| Command::TaskState { task, resp }).await
    }

    /// The package id a task operates on; empty until an installation
    /// task has discovered it from the package header.
    pub async fn task_package_id(&self, task_id: &str) -> Result<Option<String>> {
        let task = task_id.to_string();
        self.request(|resp| Command::TaskPackageId { task, resp })
            .await
    }

    pub async fn active_task_ids(&self) -> Result<Vec<TaskId>> {
        self.request(|resp| Command::ActiveTaskIds { resp }).await
    }

    pub async fn packages(&self) -> Result<Vec<PackageSnapshot>> {
        self.request(|resp| Command::Packages { resp }).await
    }

    pub async fn package(&self, package_id: &str) -> Result<Option<PackageSnapshot>> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::Package { package_id, resp })
            .await
    }

    /// Bytes the installed package occupies, `None` for unknown ids
    /// and pure built-ins.
    pub async fn installed_package_size(&self, package_id: &str) -> Result<Option<u64>> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::InstalledPackageSize { package_id, resp })
            .await
    }

    pub async fn installed_package_extra_metadata(
        &self,
        package_id: &str,
    ) -> Result<Option<MetaMap>> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::InstalledPackageExtraMetadata { package_id, resp })
            .await
    }

    pub async fn installed_package_extra_signed_metadata(
        &self,
        package_id: &str,
    ) -> Result<Option<MetaMap>> {
        let package_id = package_id.to_string();
        self.request(|resp| Command::InstalledPackageExtraSignedMetadata { package_id, resp })
            .await
    }

    /// Convenience for store logic and acknowledge callbacks; see
    /// [`crate::core::version::compare_versions`].
    pub fn compare_versions(version1: &str, version2: &str) -> i32 {
        crate::core::version::compare_versions(version1, version2)
    }

    /// Convenience for store logic and acknowledge callbacks; see
    /// [`crate::core::ids::validate_dns_name`].
    pub fn validate_dns_name(name: &str, minimal_part_count: usize) -> bool {
        crate::core::ids::validate_dns_name(name, minimal_part_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Install,
    Remove,
}

enum PendingTask {
    Install(InstallationTask),
    Remove(DeinstallationTask),
}

struct TaskRecord {
    kind: TaskKind,
    package_id: Option<String>,
    state: TaskState,
    control: Arc<TaskControl>,
    pending: Option<PendingTask>,
}

struct Registry {
    config: Config,
    env: Arc<TaskEnv>,
    packages: Vec<Package>,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Queued tasks, in submission order.
    incoming: VecDeque<TaskId>,
    /// The one task in its pre-acknowledge phase.
    active: Option<TaskId>,
    /// Installation tasks past extraction, finalizing concurrently.
    installing: HashSet<TaskId>,
    tx: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl Registry {
    fn new(
        config: Config,
        tx: mpsc::UnboundedSender<Command>,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        let env = Arc::new(TaskEnv {
            installation_dir: config.installation_dir.clone(),
            document_dir: config.document_dir.clone(),
            chain_of_trust: config.chain_of_trust.clone(),
            hardware_id: config.hardware_id.clone(),
            development_mode: config.development_mode,
            allow_unsigned: config.allow_unsigned,
            uid_separation: config.uid_separation,
            helper: config.helper.clone(),
            probe: config.runtime_probe.clone(),
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        });
        Self {
            config,
            env,
            packages: Vec::new(),
            tasks: HashMap::new(),
            incoming: VecDeque::new(),
            active: None,
            installing: HashSet::new(),
            tx,
            notifications,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
    }

    fn notify(&self, notification: Notification) {
        // nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::StartPackageInstallation { source, resp } => {
                let _ = resp.send(self.start_package_installation(source));
            }
            Command::AcknowledgePackageInstallation { task } => self.acknowledge(&task),
            Command::RemovePackage {
                package_id,
                keep_documents,
                resp,
            } => {
                let _ = resp.send(self.remove_package(&package_id, keep_documents));
            }
            Command::CancelTask { task, resp } => {
                let _ = resp.send(self.cancel_task(&task));
            }
            Command::TaskState { task, resp } => {
                let _ = resp.send(self.tasks.get(&task).map(|r| r.state));
            }
            Command::TaskPackageId { task, resp } => {
                let _ = resp.send(self.tasks.get(&task).and_then(|r| r.package_id.clone()));
            }
            Command::ActiveTaskIds { resp } => {
                let _ = resp.send(self.tasks.keys().cloned().collect());
            }
            Command::Packages { resp } => {
                let _ = resp.send(self.packages.iter().map(Package::snapshot).collect());
            }
            Command::Package { package_id, resp } => {
                let _ = resp.send(self.find_package(&package_id).map(Package::snapshot));
            }
            Command::InstalledPackageSize { package_id, resp } => {
                let _ = resp.send(self.with_report(&package_id, |r| r.disk_space_used));
            }
            Command::InstalledPackageExtraMetadata { package_id, resp } => {
                let _ = resp.send(self.with_report(&package_id, |r| r.extra_metadata.clone()));
            }
            Command::InstalledPackageExtraSignedMetadata { package_id, resp } => {
                let _ =
                    resp.send(self.with_report(&package_id, |r| r.extra_signed_metadata.clone()));
            }
            Command::Task { task, event } => self.handle_task_event(&task, event),
            Command::StartingPackageInstallation { task, info, resp } => {
                let _ = resp.send(self.starting_package_installation(&task, *info));
            }
            Command::StartingPackageRemoval {
                task,
                package_id,
                resp,
            } => {
                let _ = resp.send(self.starting_package_removal(&task, &package_id));
            }
            Command::FinishedPackageInstall { package_id, resp } => {
                let _ = resp.send(self.finished_package_install(&package_id));
            }
            Command::CanceledPackageInstall { package_id, resp } => {
                let _ = resp.send(self.canceled_package_install(&package_id));
            }
        }
    }

    // ----- queue discipline -----

    fn client(&self, task: &TaskId) -> RegistryClient {
        RegistryClient {
            task: task.clone(),
            tx: self.tx.clone(),
        }
    }

    fn start_package_installation(&mut self, source: String) -> TaskId {
        let id = next_task_id();
        let control = TaskControl::new();
        let task = InstallationTask {
            id: id.clone(),
            source: PackageSource::parse(&source),
            env: self.env.clone(),
            control: control.clone(),
            registry: self.client(&id),
        };
        self.tasks.insert(
            id.clone(),
            TaskRecord {
                kind: TaskKind::Install,
                package_id: None,
                state: TaskState::Queued,
                control,
                pending: Some(PendingTask::Install(task)),
            },
        );
        self.incoming.push_back(id.clone());
        self.execute_next();
        id
    }

    fn remove_package(&mut self, package_id: &str, keep_documents: bool) -> Result<TaskId> {
        if self.find_package(package_id).is_none() {
            return Err(Error::NotInstalled(format!(
                "cannot remove package {package_id} because it is not installed"
            )));
        }

        let id = next_task_id();
        let control = TaskControl::new();
        let task = DeinstallationTask {
            id: id.clone(),
            package_id: package_id.to_string(),
            keep_documents,
            env: self.env.clone(),
            control: control.clone(),
            registry: self.client(&id),
        };
        self.tasks.insert(
            id.clone(),
            TaskRecord {
                kind: TaskKind::Remove,
                package_id: Some(package_id.to_string()),
                state: TaskState::Queued,
                control,
                pending: Some(PendingTask::Remove(task)),
            },
        );
        self.incoming.push_back(id.clone());
        self.execute_next();
        Ok(id)
    }

    fn execute_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(task_id) = self.incoming.pop_front() else {
            return;
        };
        let Some(record) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let Some(pending) = record.pending.take() else {
            return;
        };

        record.state = TaskState::Executing;
        self.active = Some(task_id.clone());
        self.notify(Notification::TaskStateChanged {
            task: task_id,
            state: TaskState::Executing,
        });
        match pending {
            PendingTask::Install(task) => {
                tokio::spawn(task.run());
            }
            PendingTask::Remove(task) => {
                tokio::spawn(task.run());
            }
        }
    }

    fn acknowledge(&mut self, task_id: &str) {
        if let Some(record) = self.tasks.get(task_id) {
            if record.kind == TaskKind::Install {
                record.control.ack.acknowledge();
            }
        }
    }

    fn cancel_task(&mut self, task_id: &str) -> bool {
        // queued tasks can be canceled right away
        if let Some(pos) = self.incoming.iter().position(|t| t == task_id) {
            self.incoming.remove(pos);
            self.tasks.remove(task_id);
            self.notify(Notification::TaskStateChanged {
                task: task_id.to_string(),
                state: TaskState::Failed,
            });
            self.notify(Notification::TaskFailed {
                task: task_id.to_string(),
                code: Error::Canceled.code(),
                message: Error::Canceled.to_string(),
            });
            return true;
        }

        // the active and installing tasks might be past the point
        // where cancellation is possible, so we have to ask them
        match self.tasks.get(task_id) {
            Some(record) => record.control.cancel(),
            None => false,
        }
    }

    fn handle_task_event(&mut self, task_id: &str, event: TaskEvent) {
        if !self.tasks.contains_key(task_id) {
            return;
        }

        match event {
            TaskEvent::Started => {
                self.notify(Notification::TaskStarted {
                    task: task_id.to_string(),
                });
            }
            TaskEvent::StateChanged(state) => {
                if let Some(record) = self.tasks.get_mut(task_id) {
                    record.state = state;
                }
                self.notify(Notification::TaskStateChanged {
                    task: task_id.to_string(),
                    state,
                });
            }
            TaskEvent::Progress(progress) => {
                self.notify(Notification::TaskProgressChanged {
                    task: task_id.to_string(),
                    progress,
                });
                let package_id = self.tasks.get(task_id).and_then(|r| r.package_id.clone());
                if let Some(package_id) = package_id {
                    if let Some(pkg) = self.find_package_mut(&package_id) {
                        if pkg.state != PackageState::Installed {
                            pkg.progress = progress;
                            let snapshot = pkg.snapshot();
                            self.notify(Notification::PackageChanged { package: snapshot });
                        }
                    }
                }
            }
            TaskEvent::ExtractionFinished => {
                debug!("task {task_id} finished extraction, waiting for acknowledge");
                self.notify(Notification::TaskBlockingUntilInstallationAcknowledge {
                    task: task_id.to_string(),
                });
                // the next queued task may start in parallel; the
                // commit mutex serializes the final steps
                if self.active.as_deref() == Some(task_id) {
                    self.active = None;
                }
                self.installing.insert(task_id.to_string());
                self.execute_next();
            }
            TaskEvent::AcknowledgeRequested {
                extra_metadata,
                extra_signed_metadata,
            } => {
                let package_id = self.tasks.get(task_id).and_then(|r| r.package_id.clone());
                let snapshot = package_id
                    .as_deref()
                    .and_then(|id| self.find_package(id))
                    .map(Package::snapshot);
                match snapshot {
                    Some(package) => {
                        self.notify(Notification::TaskRequestingInstallationAcknowledge {
                            task: task_id.to_string(),
                            package,
                            extra_metadata,
                            extra_signed_metadata,
                        });
                    }
                    None => warn!("task {task_id} requested acknowledge without a package"),
                }
            }
            TaskEvent::Finished => {
                self.notify(Notification::TaskStateChanged {
                    task: task_id.to_string(),
                    state: TaskState::Finished,
                });
                debug!("task {task_id} finished");
                self.notify(Notification::TaskFinished {
                    task: task_id.to_string(),
                });
                self.finish_task(task_id);
            }
            TaskEvent::Failed(error) => {
                self.notify(Notification::TaskStateChanged {
                    task: task_id.to_string(),
                    state: TaskState::Failed,
                });
                debug!("task {task_id} failed: {error}");
                self.notify(Notification::TaskFailed {
                    task: task_id.to_string(),
                    code: error.code(),
                    message: error.to_string(),
                });
                self.finish_task(task_id);
            }
        }
    }

    fn finish_task(&mut self, task_id: &str) {
        if self.active.as_deref() == Some(task_id) {
            self.active = None;
        }
        self.installing.remove(task_id);
        self.tasks.remove(task_id);
        self.execute_next();
    }

    // ----- handshakes with running tasks -----

    fn starting_package_installation(
        &mut self,
        task_id: &str,
        info: PackageInfo,
    ) -> Result<Option<u32>> {
        let package_id = info.id.clone();
        if let Some(record) = self.tasks.get_mut(task_id) {
            record.package_id = Some(package_id.clone());
        }

        if let Some(pkg) = self.find_package_mut(&package_id) {
            // update of an existing package
            if pkg.blocked || pkg.state != PackageState::Installed {
                let message = match pkg.state {
                    PackageState::BeingInstalled | PackageState::BeingUpdated => format!(
                        "cannot install the same package {package_id} multiple times in parallel"
                    ),
                    _ => format!("package {package_id} is currently being modified"),
                };
                return Err(Error::Package(message));
            }
            pkg.block();
            pkg.state = PackageState::BeingUpdated;
            pkg.progress = 0.0;
            // the new manifest is only applied after a successful
            // commit; see finished_package_install
            let snapshot = pkg.snapshot();
            let uid = pkg.uid;
            self.notify(Notification::PackageChanged { package: snapshot });
            match uid {
                Some(uid) => Ok(Some(uid)),
                None => {
                    let uid = self.next_unused_uid()?;
                    if let Some(pkg) = self.find_package_mut(&package_id) {
                        pkg.uid = uid;
                    }
                    Ok(uid)
                }
            }
        } else {
            // fresh installation: register a new blocked package
            let uid = self.next_unused_uid()?;
            let dir = self.config.installation_dir.join(&package_id);
            let mut pkg = Package::new(
                RegisteredInfo {
                    info,
                    report: None,
                    dir,
                },
                false,
                PackageState::BeingInstalled,
            );
            pkg.uid = uid;
            debug!("installing package {package_id}");
            self.packages.push(pkg);
            self.notify(Notification::PackageAdded {
                package_id: package_id.clone(),
            });
            Ok(uid)
        }
    }

    fn starting_package_removal(&mut self, task_id: &str, package_id: &str) -> Result<()> {
        let Some(pkg) = self.find_package_mut(package_id) else {
            return Err(Error::NotInstalled(format!(
                "cannot remove package {package_id} because it is not installed"
            )));
        };

        if pkg.blocked || pkg.state != PackageState::Installed {
            return Err(Error::Package(format!(
                "package {package_id} is currently being modified"
            )));
        }
        if pkg.built_in && !pkg.built_in_has_removable_update() {
            return Err(Error::Package(format!(
                "there is no removable update for the built-in package {package_id}"
            )));
        }

        // blocking implicitly stops all applications in this package
        pkg.block();
        pkg.state = if pkg.built_in_has_removable_update() {
            PackageState::BeingDowngraded
        } else {
            PackageState::BeingRemoved
        };
        pkg.progress = 0.0;
        let snapshot = pkg.snapshot();
        self.notify(Notification::PackageChanged { package: snapshot });

        if let Some(record) = self.tasks.get_mut(task_id) {
            record.package_id = Some(package_id.to_string());
        }
        Ok(())
    }

    fn finished_package_install(&mut self, package_id: &str) -> Result<()> {
        let Some(idx) = self.packages.iter().position(|p| p.id() == package_id) else {
            return Err(Error::NotInstalled(format!(
                "package {package_id} is not registered"
            )));
        };

        match self.packages[idx].state {
            PackageState::Installed => Err(Error::Package(format!(
                "package {package_id} is not being installed or removed"
            ))),

            PackageState::BeingInstalled | PackageState::BeingUpdated => {
                let is_update = self.packages[idx].state == PackageState::BeingUpdated;
                let dir = self.config.installation_dir.join(package_id);
                let new_info = load_committed(&dir, package_id)?;

                let pkg = &mut self.packages[idx];
                let old_info = if is_update {
                    let old = pkg.current().info.clone();
                    if pkg.built_in {
                        pkg.updated = Some(new_info);
                    } else {
                        pkg.base = new_info;
                    }
                    Some(old)
                } else {
                    pkg.base = new_info;
                    None
                };
                pkg.state = PackageState::Installed;
                pkg.progress = 0.0;
                pkg.unblock();

                let current = pkg.current().info.clone();
                let snapshot = pkg.snapshot();
                if let Some(old) = old_info {
                    self.unregister_applications_and_intents(&old);
                }
                self.register_applications_and_intents(&current);
                self.notify(Notification::PackageChanged { package: snapshot });
                Ok(())
            }

            PackageState::BeingDowngraded => {
                // removing the update reverts a built-in to its base
                // manifest; the retained base info is reused as-is
                let pkg = &mut self.packages[idx];
                let removed = pkg.updated.take();
                pkg.state = PackageState::Installed;
                pkg.progress = 0.0;
                pkg.unblock();

                let base = pkg.base.info.clone();
                let snapshot = pkg.snapshot();
                if let Some(removed) = removed {
                    self.unregister_applications_and_intents(&removed.info);
                }
                self.register_applications_and_intents(&base);
                self.notify(Notification::PackageChanged { package: snapshot });
                Ok(())
            }

            PackageState::BeingRemoved => {
                let pkg = self.packages.remove(idx);
                self.unregister_applications_and_intents(&pkg.current().info);
                self.notify(Notification::PackageAboutToBeRemoved {
                    package_id: pkg.id().to_string(),
                });
                Ok(())
            }
        }
    }

    fn canceled_package_install(&mut self, package_id: &str) -> Result<()> {
        let Some(idx) = self.packages.iter().position(|p| p.id() == package_id) else {
            return Err(Error::NotInstalled(format!(
                "package {package_id} is not registered"
            )));
        };

        match self.packages[idx].state {
            PackageState::Installed => Err(Error::Package(format!(
                "package {package_id} is not being installed or removed"
            ))),

            PackageState::BeingInstalled => {
                // never completed: drop it from the model again
                let pkg = self.packages.remove(idx);
                self.notify(Notification::PackageAboutToBeRemoved {
                    package_id: pkg.id().to_string(),
                });
                Ok(())
            }

            PackageState::BeingUpdated
            | PackageState::BeingDowngraded
            | PackageState::BeingRemoved => {
                let pkg = &mut self.packages[idx];
                pkg.state = PackageState::Installed;
                pkg.progress = 0.0;
                pkg.unblock();
                let snapshot = pkg.snapshot();
                self.notify(Notification::PackageChanged { package: snapshot });
                Ok(())
            }
        }
    }

    // ----- startup -----

    fn register_seed(&mut self, seed: PackageSeed) {
        let mut pkg = Package::new(seed.base, seed.built_in, PackageState::Installed);
        pkg.updated = seed.updated;
        debug!(
            " + package: {} [at: {}]",
            pkg.id(),
            pkg.current().dir.display()
        );
        self.notify(Notification::PackageAdded {
            package_id: pkg.id().to_string(),
        });
        let current = pkg.current().info.clone();
        self.packages.push(pkg);
        self.register_applications_and_intents(&current);
    }

    /// Removes registry entries whose on-disk state is gone and every
    /// directory entry no registered package references.
    fn cleanup_broken_installations(&mut self) -> Result<()> {
        let mut broken = Vec::new();
        for pkg in &self.packages {
            let current = pkg.current();
            if current.report.is_none() {
                continue;
            }
            if let Some(missing) = first_missing_piece(&current.dir) {
                warn!("cleanup: uninstalling {} - {missing}", pkg.id());
                broken.push(pkg.id().to_string());
            }
        }
        for package_id in broken {
            self.discard_broken(&package_id);
        }

        let valid: HashSet<String> = self
            .packages
            .iter()
            .filter(|p| p.current().report.is_some())
            .map(|p| p.id().to_string())
            .collect();

        let installation_dir = self.config.installation_dir.clone();
        self.sweep_unreferenced(&installation_dir, &valid)?;
        if let Some(document_dir) = self.config.document_dir.clone() {
            self.sweep_unreferenced(&document_dir, &valid)?;
        }
        Ok(())
    }

    fn discard_broken(&mut self, package_id: &str) {
        let Some(idx) = self.packages.iter().position(|p| p.id() == package_id) else {
            return;
        };

        if self.packages[idx].built_in_has_removable_update() {
            // broken update to a built-in: revert to the base manifest
            let removed = self.packages[idx].updated.take();
            let base = self.packages[idx].base.info.clone();
            let snapshot = self.packages[idx].snapshot();
            if let Some(removed) = removed {
                self.unregister_applications_and_intents(&removed.info);
            }
            self.register_applications_and_intents(&base);
            self.notify(Notification::PackageChanged { package: snapshot });
        } else {
            let pkg = self.packages.remove(idx);
            self.unregister_applications_and_intents(&pkg.current().info);
            self.notify(Notification::PackageAboutToBeRemoved {
                package_id: pkg.id().to_string(),
            });
        }
    }

    fn sweep_unreferenced(&self, dir: &Path, valid: &HashSet<String>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::io_context(format!("cannot read {}", dir.display()), e))
            }
        };

        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io_context(format!("cannot read {}", dir.display()), e))?;
            let path = entry.path();
            let keep = path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| valid.contains(name));
            if !keep {
                warn!("cleanup: removing unreferenced entry {}", path.display());
                self.remove_recursive(&path).map_err(|e| {
                    Error::Filesystem(format!(
                        "could not remove broken installation leftover {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn remove_recursive(&self, path: &Path) -> Result<()> {
        if self.config.uid_separation.is_some() {
            self.config.helper.remove_recursive(path)
        } else {
            remove_path_recursive(path)
        }
    }

    // ----- helpers -----

    fn find_package(&self, package_id: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.id() == package_id)
    }

    fn find_package_mut(&mut self, package_id: &str) -> Option<&mut Package> {
        self.packages.iter_mut().find(|p| p.id() == package_id)
    }

    fn with_report<T>(
        &self,
        package_id: &str,
        f: impl FnOnce(&InstallationReport) -> T,
    ) -> Option<T> {
        self.find_package(package_id)
            .and_then(|p| p.current().report.as_ref())
            .map(f)
    }

    /// Lowest uid in the configured range not taken by any package.
    fn next_unused_uid(&self) -> Result<Option<u32>> {
        let Some(range) = self.config.uid_separation else {
            return Ok(None);
        };
        for uid in range.min_uid..=range.max_uid {
            if !self.packages.iter().any(|p| p.uid == Some(uid)) {
                return Ok(Some(uid));
            }
        }
        Err(Error::Internal(
            "could not find a free user id for application-user-id separation".into(),
        ))
    }

    fn register_applications_and_intents(&self, info: &PackageInfo) {
        for app in &info.applications {
            self.notify(Notification::ApplicationRegistered {
                package_id: info.id.clone(),
                application_id: app.id.clone(),
            });
        }
        for intent in &info.intents {
            self.notify(Notification::IntentRegistered {
                package_id: info.id.clone(),
                intent_id: intent.id.clone(),
            });
        }
    }

    fn unregister_applications_and_intents(&self, info: &PackageInfo) {
        for intent in &info.intents {
            self.notify(Notification::IntentUnregistered {
                package_id: info.id.clone(),
                intent_id: intent.id.clone(),
            });
        }
        for app in &info.applications {
            self.notify(Notification::ApplicationUnregistered {
                package_id: info.id.clone(),
                application_id: app.id.clone(),
            });
        }
    }
}

/// Loads manifest and report of a freshly committed installation.
fn load_committed(dir: &Path, package_id: &str) -> Result<RegisteredInfo> {
    let info = PackageInfo::load_file(&dir.join(MANIFEST_NAME))?;
    let report_path = dir.join(REPORT_NAME);
    let data = std::fs::read(&report_path)
        .map_err(|e| Error::io_context(format!("cannot read {}", report_path.display()), e))?;
    let report = InstallationReport::load(&data)?;
    if info.id != package_id || report.package_id != package_id {
        return Err(Error::Internal(format!(
            "committed package in {} does not belong to {package_id}",
            dir.display()
        )));
    }
    Ok(RegisteredInfo {
        info,
        report: Some(report),
        dir: dir.to_path_buf(),
    })
}

/// Returns a description of the first missing/unreadable piece of an
/// installed package directory, or `None` when everything is in place.
fn first_missing_piece(dir: &Path) -> Option<String> {
    if !dir.is_dir() {
        return Some(format!("directory missing: {}", dir.display()));
    }
    for file in [MANIFEST_NAME, REPORT_NAME] {
        let path = dir.join(file);
        if !path.is_file() || std::fs::File::open(&path).is_err() {
            return Some(format!("file missing or unreadable: {}", path.display()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::UidRange;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn test_registry(dir: &Path) -> Registry {
        let mut config = Config::new(dir.join("installed"));
        config.uid_separation = Some(UidRange {
            min_uid: 1000,
            max_uid: 1002,
            common_gid: 1000,
        });
        std::fs::create_dir_all(&config.installation_dir).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(16);
        Registry::new(config, tx, notify)
    }

    fn info(id: &str) -> PackageInfo {
        PackageInfo {
            id: id.into(),
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
    fn test_uid_assignment_skips_taken_ids() {
        let tmp = tempdir().unwrap();
        let mut registry = test_registry(tmp.path());

        let uid1 = registry
            .starting_package_installation("t1", info("com.x.one"))
            .unwrap();
        assert_eq!(uid1, Some(1000));
        let uid2 = registry
            .starting_package_installation("t2", info("com.x.two"))
            .unwrap();
        assert_eq!(uid2, Some(1001));
        let uid3 = registry
            .starting_package_installation("t3", info("com.x.three"))
            .unwrap();
        assert_eq!(uid3, Some(1002));

        let err = registry
            .starting_package_installation("t4", info("com.x.four"))
            .unwrap_err();
        assert!(err.to_string().contains("free user id"));
    }

    #[test]
    fn test_parallel_install_of_same_id_is_declined() {
        let tmp = tempdir().unwrap();
        let mut registry = test_registry(tmp.path());

        registry
            .starting_package_installation("t1", info("com.x.app"))
            .unwrap();
        let err = registry
            .starting_package_installation("t2", info("com.x.app"))
            .unwrap_err();
        assert!(err.to_string().contains("multiple times in parallel"));
        assert_eq!(err.code(), crate::error::ErrorCode::Package);
    }

    #[test]
    fn test_removal_of_unknown_package_is_declined() {
        let tmp = tempdir().unwrap();
        let mut registry = test_registry(tmp.path());
        let err = registry
            .starting_package_removal("t1", "com.x.ghost")
            .unwrap_err();
        assert!(matches!(err, Error::NotInstalled(_)));
    }

    #[test]
    fn test_removal_of_builtin_without_update_is_declined() {
        let tmp = tempdir().unwrap();
        let mut registry = test_registry(tmp.path());
        registry.register_seed(PackageSeed {
            base: RegisteredInfo {
                info: info("builtin.x"),
                report: None,
                dir: tmp.path().join("builtin/builtin.x"),
            },
            updated: None,
            built_in: true,
        });

        let err = registry
            .starting_package_removal("t1", "builtin.x")
            .unwrap_err();
        assert!(err.to_string().contains("no removable update"));
    }

    #[test]
    fn test_canceled_fresh_install_disappears() {
        let tmp = tempdir().unwrap();
        let mut registry = test_registry(tmp.path());

        registry
            .starting_package_installation("t1", info("com.x.app"))
            .unwrap();
        assert!(registry.find_package("com.x.app").is_some());

        registry.canceled_package_install("com.x.app").unwrap();
        assert!(registry.find_package("com.x.app").is_none());
    }

    #[test]
    fn test_canceled_update_reverts_to_installed() {
        let tmp = tempdir().unwrap();
        let mut registry = test_registry(tmp.path());
        registry.register_seed(PackageSeed {
            base: RegisteredInfo {
                info: info("com.x.app"),
                report: None,
                dir: tmp.path().join("installed/com.x.app"),
            },
            updated: None,
            built_in: false,
        });

        registry
            .starting_package_installation("t1", info("com.x.app"))
            .unwrap();
        {
            let pkg = registry.find_package("com.x.app").unwrap();
            assert_eq!(pkg.state, PackageState::BeingUpdated);
            assert!(pkg.blocked);
        }

        registry.canceled_package_install("com.x.app").unwrap();
        let pkg = registry.find_package("com.x.app").unwrap();
        assert_eq!(pkg.state, PackageState::Installed);
        assert!(!pkg.blocked);
    }
}
