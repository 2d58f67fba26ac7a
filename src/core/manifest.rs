//! Package manifest (`info.yaml`) model.
//!
//! A manifest is a two-document YAML file: a format header followed by
//! the package description. It is the unit both the built-in manifest
//! directories and the installed-package directories are scanned for.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::ids::is_valid_package_id;
use crate::core::yaml;
use crate::error::{Error, Result};

/// Manifest file name inside every package directory.
pub const MANIFEST_NAME: &str = "info.yaml";

const FORMAT_TYPE: &str = "am-package";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormatHeader {
    format_type: String,
    format_version: u32,
}

/// One application shipped by a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub id: String,
    /// Entry point, relative to the package directory.
    pub code: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

fn default_runtime() -> String {
    "native".to_string()
}

/// One intent handled by an application of the package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
}

/// Parsed `info.yaml` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub id: String,
    pub version: String,
    /// Localized display names, keyed by language tag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub name: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub description: BTreeMap<String, String>,
    /// Icon file, relative to the package directory.
    pub icon: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intents: Vec<IntentInfo>,
}

impl PackageInfo {
    /// Parses a manifest from raw bytes.
    pub fn load(data: &[u8]) -> Result<Self> {
        let docs = yaml::parse_documents(data)?;
        if docs.len() != 2 {
            return Err(Error::Parse(format!(
                "a manifest must consist of exactly 2 YAML documents (found {})",
                docs.len()
            )));
        }

        let header: FormatHeader = yaml::from_document(&docs[0])?;
        if header.format_type != FORMAT_TYPE || header.format_version != FORMAT_VERSION {
            return Err(Error::Parse(format!(
                "unsupported manifest format: {} version {}",
                header.format_type, header.format_version
            )));
        }

        let info: Self = yaml::from_document(&docs[1])?;
        info.validate()?;
        Ok(info)
    }

    /// Parses a manifest file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::io_context(format!("cannot read {}", path.display()), e))?;
        Self::load(&data)
    }

    /// Serializes the manifest into the two-document form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut out = String::new();
        yaml::write_document(
            &mut out,
            &FormatHeader {
                format_type: FORMAT_TYPE.to_string(),
                format_version: FORMAT_VERSION,
            },
        )?;
        yaml::write_document(&mut out, self)?;
        Ok(out.into_bytes())
    }

    /// Writes the manifest to `dir/info.yaml`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_NAME);
        std::fs::write(&path, self.serialize()?)
            .map_err(|e| Error::io_context(format!("cannot write {}", path.display()), e))
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_package_id(&self.id) {
            return Err(Error::Parse(format!(
                "the package id '{}' is not a valid DNS-style id",
                self.id
            )));
        }
        if self.version.is_empty() {
            return Err(Error::Parse(format!(
                "package {} does not specify a version",
                self.id
            )));
        }
        if self.icon.is_empty() {
            return Err(Error::Parse(format!(
                "the 'icon' field in the manifest of {} cannot be empty or absent",
                self.id
            )));
        }
        for app in &self.applications {
            if !is_valid_package_id(&app.id) {
                return Err(Error::Parse(format!(
                    "the application id '{}' is not a valid DNS-style id",
                    app.id
                )));
            }
            if app.code.is_empty() {
                return Err(Error::Parse(format!(
                    "application {} does not specify a code entry point",
                    app.id
                )));
            }
        }
        for intent in &self.intents {
            if intent.id.is_empty() {
                return Err(Error::Parse(format!(
                    "package {} declares an intent without an id",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Best localized name, preferring `en`, then any entry, then the id.
    pub fn display_name(&self) -> &str {
        self.name
            .get("en")
            .or_else(|| self.name.values().next())
            .map_or(&self.id, String::as_str)
    }
}
