//! In-memory package model.

use std::path::PathBuf;

use crate::core::manifest::PackageInfo;
use crate::core::report::InstallationReport;

/// Lifecycle state of a registered package.
///
/// `Installed` is the only state in which the package is not blocked;
/// every mutating state blocks it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageState {
    Installed,
    BeingInstalled,
    BeingUpdated,
    BeingDowngraded,
    BeingRemoved,
}

/// One registered manifest plus its on-disk context.
#[derive(Debug, Clone)]
pub(crate) struct RegisteredInfo {
    pub info: PackageInfo,
    /// Present for everything that lives in the installation
    /// directory; built-in base manifests have none.
    pub report: Option<InstallationReport>,
    pub dir: PathBuf,
}

/// A package as the registry owns it.
///
/// `base` is the primary manifest (built-in or plain installed);
/// `updated` only exists for built-ins that have an update applied and
/// supersedes `base` while present.
#[derive(Debug)]
pub(crate) struct Package {
    pub base: RegisteredInfo,
    pub updated: Option<RegisteredInfo>,
    pub built_in: bool,
    pub state: PackageState,
    pub blocked: bool,
    pub progress: f32,
    pub uid: Option<u32>,
}

impl Package {
    pub fn new(base: RegisteredInfo, built_in: bool, state: PackageState) -> Self {
        Self {
            base,
            updated: None,
            built_in,
            state,
            blocked: state != PackageState::Installed,
            progress: 0.0,
            uid: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.base.info.id
    }

    /// The active manifest: the update when applied, the base otherwise.
    pub fn current(&self) -> &RegisteredInfo {
        self.updated.as_ref().unwrap_or(&self.base)
    }

    pub fn built_in_has_removable_update(&self) -> bool {
        self.built_in && self.updated.is_some()
    }

    /// Blocks the package; the runtime subsystem must stop all of its
    /// applications and refuse to start new ones. Returns `false` when
    /// it was already blocked.
    pub fn block(&mut self) -> bool {
        if self.blocked {
            return false;
        }
        self.blocked = true;
        true
    }

    pub fn unblock(&mut self) {
        self.blocked = false;
    }

    pub fn snapshot(&self) -> PackageSnapshot {
        PackageSnapshot {
            info: self.current().info.clone(),
            state: self.state,
            blocked: self.blocked,
            progress: self.progress,
            built_in: self.built_in,
            has_removable_update: self.built_in_has_removable_update(),
            uid: self.uid,
        }
    }
}

/// Immutable view of one package, as handed out by queries and carried
/// in notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSnapshot {
    /// The currently active manifest.
    pub info: PackageInfo,
    pub state: PackageState,
    pub blocked: bool,
    pub progress: f32,
    pub built_in: bool,
    pub has_removable_update: bool,
    /// Application user id, when uid separation is enabled.
    pub uid: Option<u32>,
}

impl PackageSnapshot {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn info(id: &str, version: &str) -> PackageInfo {
        PackageInfo {
            id: id.into(),
            version: version.into(),
            name: BTreeMap::new(),
            description: BTreeMap::new(),
            icon: "icon.png".into(),
            categories: vec![],
            applications: vec![],
            intents: vec![],
        }
    }

    fn registered(id: &str, version: &str) -> RegisteredInfo {
        RegisteredInfo {
            info: info(id, version),
            report: None,
            dir: PathBuf::from("/packages").join(id),
        }
    }

    #[test]
    fn test_new_installed_package_is_unblocked() {
        let pkg = Package::new(registered("com.x.a", "1.0"), false, PackageState::Installed);
        assert!(!pkg.blocked);
        assert_eq!(pkg.state, PackageState::Installed);
    }

    #[test]
    fn test_package_being_installed_is_blocked() {
        let pkg = Package::new(
            registered("com.x.a", "1.0"),
            false,
            PackageState::BeingInstalled,
        );
        assert!(pkg.blocked);
    }

    #[test]
    fn test_update_supersedes_base() {
        let mut pkg = Package::new(registered("com.x.a", "1.0"), true, PackageState::Installed);
        assert_eq!(pkg.current().info.version, "1.0");
        assert!(!pkg.built_in_has_removable_update());

        pkg.updated = Some(registered("com.x.a", "2.0"));
        assert_eq!(pkg.current().info.version, "2.0");
        assert!(pkg.built_in_has_removable_update());
    }

    #[test]
    fn test_block_is_edge_triggered() {
        let mut pkg = Package::new(registered("com.x.a", "1.0"), false, PackageState::Installed);
        assert!(pkg.block());
        assert!(!pkg.block());
        pkg.unblock();
        assert!(pkg.block());
    }
}
