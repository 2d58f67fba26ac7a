//! Startup scanning of the package databases.
//!
//! Built-in packages come from read-only manifest directories shipped
//! with the system (one subdirectory with an `info.yaml` each).
//! Installed packages live in the installation directory, one `<id>/`
//! entry with a manifest and a MAC-verified installation report.
//!
//! Broken installed entries are skipped here with a warning; the
//! registry's cleanup pass then deletes everything on disk that no
//! registered package references. Problems with built-in manifests are
//! fatal: the system image itself is broken.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::manifest::{PackageInfo, MANIFEST_NAME};
use crate::core::report::{InstallationReport, REPORT_NAME};
use crate::error::{Error, Result};
use crate::registry::model::RegisteredInfo;

/// One package as assembled from the on-disk databases.
#[derive(Debug)]
pub(crate) struct PackageSeed {
    pub base: RegisteredInfo,
    pub updated: Option<RegisteredInfo>,
    pub built_in: bool,
}

/// Scans built-in and installed package locations into seeds, pairing
/// updates with their built-in base.
pub(crate) fn scan(config: &Config) -> Result<Vec<PackageSeed>> {
    let mut seeds: BTreeMap<String, PackageSeed> = BTreeMap::new();

    for dir in &config.builtin_dirs {
        scan_builtin_dir(dir, &mut seeds)?;
    }
    scan_installed_dir(&config.installation_dir, &mut seeds)?;

    Ok(seeds.into_values().collect())
}

fn scan_builtin_dir(dir: &Path, seeds: &mut BTreeMap<String, PackageSeed>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::io_context(
            format!("cannot read built-in manifest directory {}", dir.display()),
            e,
        )
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::io_context("cannot scan built-in packages", e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let info = PackageInfo::load_file(&path.join(MANIFEST_NAME)).map_err(|e| {
            Error::Package(format!(
                "invalid built-in package manifest in {}: {e}",
                path.display()
            ))
        })?;

        if let Some(existing) = seeds.get(&info.id) {
            return Err(Error::Package(format!(
                "found more than one built-in package with id '{}': here: {} and there: {}",
                info.id,
                existing.base.dir.display(),
                path.display()
            )));
        }

        debug!("registering built-in package {} from {}", info.id, path.display());
        seeds.insert(
            info.id.clone(),
            PackageSeed {
                base: RegisteredInfo {
                    info,
                    report: None,
                    dir: path,
                },
                updated: None,
                built_in: true,
            },
        );
    }
    Ok(())
}

fn scan_installed_dir(dir: &Path, seeds: &mut BTreeMap<String, PackageSeed>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::io_context(
            format!("cannot read installation directory {}", dir.display()),
            e,
        )
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::io_context("cannot scan installed packages", e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue; // stray files are swept by the cleanup pass
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let registered = match load_installed(&path, name) {
            Ok(registered) => registered,
            Err(e) => {
                // broken entry: leave it unreferenced so cleanup
                // removes it from disk
                warn!("ignoring broken installation in {}: {e}", path.display());
                continue;
            }
        };

        match seeds.get_mut(name) {
            None => {
                debug!("registering installed package {name}");
                seeds.insert(
                    name.to_string(),
                    PackageSeed {
                        base: registered,
                        updated: None,
                        built_in: false,
                    },
                );
            }
            Some(seed) if seed.built_in => {
                if seed.updated.is_some() {
                    return Err(Error::Package(format!(
                        "found more than one update for the built-in package with id '{name}'"
                    )));
                }
                debug!("registering update for built-in package {name}");
                seed.updated = Some(registered);
            }
            Some(_) => {
                return Err(Error::Package(format!(
                    "found more than one installed package with the same id '{name}'"
                )));
            }
        }
    }
    Ok(())
}

fn load_installed(dir: &Path, expected_id: &str) -> Result<RegisteredInfo> {
    let info = PackageInfo::load_file(&dir.join(MANIFEST_NAME))?;
    if info.id != expected_id {
        return Err(Error::Package(format!(
            "directory name '{expected_id}' does not match the manifest id '{}'",
            info.id
        )));
    }

    let report_path = dir.join(REPORT_NAME);
    let data = std::fs::read(&report_path)
        .map_err(|e| Error::io_context(format!("cannot read {}", report_path.display()), e))?;
    let report = InstallationReport::load(&data)?;
    if report.package_id != expected_id {
        return Err(Error::Package(format!(
            "installation report in {} belongs to package '{}'",
            dir.display(),
            report.package_id
        )));
    }

    Ok(RegisteredInfo {
        info,
        report: Some(report),
        dir: dir.to_path_buf(),
    })
}
