//! Change notifications.
//!
//! The registry broadcasts every externally visible state change; the
//! IPC layer, UI model or a test harness subscribe via
//! [`PackageManager::subscribe`](crate::registry::PackageManager::subscribe).
//! Application/intent (un)registration with the external runtime rides
//! on the same stream.

use crate::core::report::MetaMap;
use crate::error::ErrorCode;
use crate::ops::{TaskId, TaskState};
use crate::registry::model::PackageSnapshot;

#[derive(Debug, Clone)]
pub enum Notification {
    TaskStarted {
        task: TaskId,
    },
    TaskStateChanged {
        task: TaskId,
        state: TaskState,
    },
    TaskProgressChanged {
        task: TaskId,
        progress: f32,
    },
    /// The task finished extracting and now blocks until it is
    /// acknowledged or canceled.
    TaskBlockingUntilInstallationAcknowledge {
        task: TaskId,
    },
    /// Surface this package to the operator/store logic; complete the
    /// install with `acknowledge_package_installation` or abort it with
    /// `cancel_task`.
    TaskRequestingInstallationAcknowledge {
        task: TaskId,
        package: PackageSnapshot,
        extra_metadata: MetaMap,
        extra_signed_metadata: MetaMap,
    },
    TaskFinished {
        task: TaskId,
    },
    TaskFailed {
        task: TaskId,
        code: ErrorCode,
        message: String,
    },
    PackageAdded {
        package_id: String,
    },
    PackageChanged {
        package: PackageSnapshot,
    },
    PackageAboutToBeRemoved {
        package_id: String,
    },
    ApplicationRegistered {
        package_id: String,
        application_id: String,
    },
    ApplicationUnregistered {
        package_id: String,
        application_id: String,
    },
    IntentRegistered {
        package_id: String,
        intent_id: String,
    },
    IntentUnregistered {
        package_id: String,
        intent_id: String,
    },
}
