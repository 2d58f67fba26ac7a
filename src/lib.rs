//! hangar - application package bay
//!
//! A package lifecycle manager for an embedded application platform:
//! it installs, updates, verifies and removes signed application
//! packages, and maintains the authoritative in-memory registry of
//! what is installed, merged from read-only built-in manifests and the
//! mutable installation directory.
//!
//! The entry point is [`PackageManager`]: create one from a [`Config`]
//! at startup, subscribe to its [`Notification`] stream, and drive
//! installations through the two-phase acknowledge protocol:
//!
//! ```ignore
//! let manager = PackageManager::new(config).await?;
//! let mut events = manager.subscribe();
//!
//! let task = manager.start_package_installation("/updates/app.ampkg").await?;
//! // wait for Notification::TaskRequestingInstallationAcknowledge,
//! // inspect the package metadata, then either:
//! manager.acknowledge_package_installation(&task).await?;
//! // or manager.cancel_task(&task).await?;
//! ```
//!
//! Running applications, sandboxing and UI are out of scope; the
//! runtime subsystem is attached through
//! [`core::config::RuntimeProbe`], and filesystem operations that need
//! elevated rights go through [`io::privileged::SystemHelper`].

pub mod core;
pub mod error;
pub mod io;
pub mod ops;
pub mod registry;

// Re-exports for convenience
pub use crate::core::config::{Config, NoRuntime, RuntimeProbe, UidRange};
pub use crate::core::ids::validate_dns_name;
pub use crate::core::manifest::{ApplicationInfo, IntentInfo, PackageInfo};
pub use crate::core::report::{InstallationReport, MetaMap};
pub use crate::core::version::compare_versions;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::io::extract::{PackageExtractor, PackageSource};
pub use crate::io::pack::PackageBuilder;
pub use crate::io::privileged::{DeniedHelper, DirectHelper, SystemHelper};
#[cfg(unix)]
pub use crate::io::privileged::{HelperClient, HelperServer};
pub use crate::ops::{TaskId, TaskState};
pub use crate::registry::{Notification, PackageManager, PackageSnapshot, PackageState};
