//! Asynchronous mutating tasks.
//!
//! Every mutating operation on the registry runs as a task: created and
//! queued by the registry, executed on the tokio runtime, reporting
//! back through events. A task reaches exactly one of `Finished` or
//! `Failed`.

pub mod install;
pub mod remove;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::core::config::{RuntimeProbe, UidRange};
use crate::core::report::MetaMap;
use crate::error::{Error, Result};
use crate::io::extract::CancelHandle;
use crate::io::privileged::{remove_path_recursive, SystemHelper};

/// Opaque task identifier, unique within the process lifetime.
pub type TaskId = String;

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> TaskId {
    format!("task-{}", TASK_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle states of a task.
///
/// States only move forward, except that `Failed` is reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Executing,
    AwaitingAcknowledge,
    Installing,
    CleaningUp,
    Finished,
    Failed,
}

/// Events a running task reports to the registry event loop.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    Started,
    StateChanged(TaskState),
    Progress(f32),
    /// Extraction and signature verification are done; the next queued
    /// task may start while this one waits for its acknowledge.
    ExtractionFinished,
    /// The task is now blocked in `AwaitingAcknowledge`.
    AcknowledgeRequested {
        extra_metadata: MetaMap,
        extra_signed_metadata: MetaMap,
    },
    Finished,
    Failed(Error),
}

#[derive(Debug, Default)]
struct AckState {
    acknowledged: bool,
    canceled: bool,
}

/// Synchronization point for the two-phase acknowledge protocol.
///
/// The installation task parks on [`wait`](Self::wait) until the
/// controller either acknowledges or cancels. Acknowledging is the
/// point of no return: a later cancel is refused.
#[derive(Debug, Default)]
pub(crate) struct AckGate {
    state: Mutex<AckState>,
    notify: Notify,
}

impl AckGate {
    pub fn acknowledge(&self) {
        let mut state = self.state.lock().expect("ack gate poisoned");
        if !state.canceled {
            state.acknowledged = true;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Requests cancellation; returns `false` once the task has been
    /// acknowledged and can no longer be canceled.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock().expect("ack gate poisoned");
        if state.acknowledged {
            return false;
        }
        state.canceled = true;
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Blocks until the gate is decided.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().expect("ack gate poisoned");
                if state.canceled {
                    return Err(Error::Canceled);
                }
                if state.acknowledged {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

/// Cancellation interface the registry keeps per task.
#[derive(Debug, Default)]
pub(crate) struct TaskControl {
    /// Checked by the extractor and the polling loops.
    pub cancel: CancelHandle,
    pub ack: Arc<AckGate>,
    /// Set by tasks that pass their point of no return without going
    /// through the acknowledge gate (removals).
    past_point_of_no_return: AtomicBool,
}

impl TaskControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Advisory cancel; returns whether the task may still fail with
    /// `Canceled`.
    pub fn cancel(&self) -> bool {
        if self.past_point_of_no_return.load(Ordering::Relaxed) {
            return false;
        }
        if !self.ack.cancel() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn mark_point_of_no_return(&self) {
        self.past_point_of_no_return.store(true, Ordering::Relaxed);
    }
}

/// Shared, immutable context every task runs against.
pub(crate) struct TaskEnv {
    pub installation_dir: PathBuf,
    pub document_dir: Option<PathBuf>,
    pub chain_of_trust: Vec<Vec<u8>>,
    pub hardware_id: Option<String>,
    pub development_mode: bool,
    pub allow_unsigned: bool,
    pub uid_separation: Option<UidRange>,
    pub helper: Arc<dyn SystemHelper>,
    pub probe: Arc<dyn RuntimeProbe>,
    /// Serializes the commit phase across all installation tasks.
    pub commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl TaskEnv {
    /// Removes a tree, routing through the privileged helper when
    /// uid separation may have re-owned the files.
    pub fn remove_recursive(&self, path: &Path) -> Result<()> {
        if self.uid_separation.is_some() {
            self.helper.remove_recursive(path)
        } else {
            remove_path_recursive(path)
        }
    }
}
