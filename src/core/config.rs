//! Package manager configuration.
//!
//! A plain struct the embedder fills in at startup; parsing it out of a
//! configuration file is the embedder's business.

use std::path::PathBuf;
use std::sync::Arc;

use crate::io::privileged::{DirectHelper, SystemHelper};

/// Application-uid separation parameters.
///
/// When set, every package gets its own user id out of the configured
/// range and installed files are chowned to it through the privileged
/// helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub min_uid: u32,
    pub max_uid: u32,
    /// Group id shared by all application users.
    pub common_gid: u32,
}

/// Interface to the runtime/container subsystem.
///
/// The installer only needs to know when every application of a blocked
/// package has actually stopped; launching and sandboxing live outside
/// this crate.
pub trait RuntimeProbe: Send + Sync {
    fn all_stopped_for(&self, package_id: &str) -> bool;
}

/// Probe used when no runtime subsystem is attached: nothing can be
/// running, so blocked packages are immediately stopped.
#[derive(Debug, Default)]
pub struct NoRuntime;

impl RuntimeProbe for NoRuntime {
    fn all_stopped_for(&self, _package_id: &str) -> bool {
        true
    }
}

/// Everything the package manager needs to operate.
#[derive(Clone)]
pub struct Config {
    /// Directory holding one `<id>/` entry per installed package.
    pub installation_dir: PathBuf,
    /// Optional root for per-package document directories.
    pub document_dir: Option<PathBuf>,
    /// Read-only directories with one `<dir>/info.yaml` manifest per
    /// built-in package.
    pub builtin_dirs: Vec<PathBuf>,
    /// Raw Ed25519 verifying keys that package signatures are checked
    /// against.
    pub chain_of_trust: Vec<Vec<u8>>,
    /// Device hardware id; store signatures are bound to it.
    pub hardware_id: Option<String>,
    /// Developer packages only install when the device is in
    /// development mode.
    pub development_mode: bool,
    /// Accept packages without any signature.
    pub allow_unsigned: bool,
    pub uid_separation: Option<UidRange>,
    /// Executor for filesystem operations that may need elevated
    /// rights.
    pub helper: Arc<dyn SystemHelper>,
    /// Hook into the runtime subsystem.
    pub runtime_probe: Arc<dyn RuntimeProbe>,
}

impl Config {
    pub fn new(installation_dir: impl Into<PathBuf>) -> Self {
        Self {
            installation_dir: installation_dir.into(),
            document_dir: None,
            builtin_dirs: Vec::new(),
            chain_of_trust: Vec::new(),
            hardware_id: None,
            development_mode: false,
            allow_unsigned: false,
            uid_separation: None,
            helper: Arc::new(DirectHelper),
            runtime_probe: Arc::new(NoRuntime),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("installation_dir", &self.installation_dir)
            .field("document_dir", &self.document_dir)
            .field("builtin_dirs", &self.builtin_dirs)
            .field("chain_of_trust_len", &self.chain_of_trust.len())
            .field("hardware_id", &self.hardware_id)
            .field("development_mode", &self.development_mode)
            .field("allow_unsigned", &self.allow_unsigned)
            .field("uid_separation", &self.uid_separation)
            .finish_non_exhaustive()
    }
}
