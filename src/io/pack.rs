//! Package creation and signing.
//!
//! The counterpart of the extractor: turns a source directory with an
//! `info.yaml` manifest into a signed package archive. Entries are
//! written with normalized metadata and a sorted payload order, so the
//! same tree always produces the same digest.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::core::manifest::{PackageInfo, MANIFEST_NAME};
use crate::core::report::MetaMap;
use crate::core::signature;
use crate::error::{Error, Result};
use crate::io::format::{
    DigestAccumulator, PackageFooter, PackageHeader, FOOTER_ENTRY, FOOTER_FORMAT_TYPE,
    FORMAT_VERSION, HEADER_ENTRY, HEADER_FORMAT_TYPE, MAX_ICON_SIZE,
};

enum SigningMode {
    Unsigned,
    Developer([u8; 32]),
    Store {
        key: [u8; 32],
        hardware_id: Option<String>,
    },
}

/// Builds one package archive from a source directory.
pub struct PackageBuilder {
    source_dir: PathBuf,
    extra_metadata: MetaMap,
    extra_signed_metadata: MetaMap,
    signing: SigningMode,
}

impl PackageBuilder {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            extra_metadata: MetaMap::new(),
            extra_signed_metadata: MetaMap::new(),
            signing: SigningMode::Unsigned,
        }
    }

    /// Attaches free-form metadata to the package header.
    pub fn extra_metadata(mut self, metadata: MetaMap) -> Self {
        self.extra_metadata = metadata;
        self
    }

    /// Attaches metadata that is covered by the digest (and therefore
    /// by any signature over it).
    pub fn extra_signed_metadata(mut self, metadata: MetaMap) -> Self {
        self.extra_signed_metadata = metadata;
        self
    }

    /// Signs the package digest with a developer key.
    pub fn developer_sign(mut self, signing_key: [u8; 32]) -> Self {
        self.signing = SigningMode::Developer(signing_key);
        self
    }

    /// Signs the package digest with a store key, optionally bound to
    /// one device via its hardware id.
    pub fn store_sign(mut self, signing_key: [u8; 32], hardware_id: Option<&str>) -> Self {
        self.signing = SigningMode::Store {
            key: signing_key,
            hardware_id: hardware_id.map(str::to_string),
        };
        self
    }

    /// Writes the package archive to `destination`.
    pub fn create(self, destination: &Path) -> Result<()> {
        let manifest_path = self.source_dir.join(MANIFEST_NAME);
        let info = PackageInfo::load_file(&manifest_path)?;

        let icon_path = self.source_dir.join(&info.icon);
        let icon_size = icon_path
            .metadata()
            .map_err(|e| Error::io_context(format!("cannot read {}", icon_path.display()), e))?
            .len();
        if icon_size > MAX_ICON_SIZE {
            return Err(Error::Package(format!(
                "the size of {} is too large (max. 256KB)",
                info.icon
            )));
        }

        // manifest and icon first, then the payload in sorted order
        let mut entries = vec![MANIFEST_NAME.to_string(), info.icon.clone()];
        entries.extend(self.collect_payload(&info)?);

        let disk_space_used: u64 = entries
            .iter()
            .map(|rel| {
                self.source_dir
                    .join(rel)
                    .metadata()
                    .map(|m| m.len())
                    .unwrap_or(0)
            })
            .sum::<u64>()
            .max(1);

        let file = File::create(destination).map_err(|e| {
            Error::io_context(format!("cannot create {}", destination.display()), e)
        })?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let header_doc = PackageHeader {
            format_type: HEADER_FORMAT_TYPE.to_string(),
            format_version: FORMAT_VERSION,
            package_id: info.id.clone(),
            disk_space_used,
            extra_meta_data: self.extra_metadata.clone(),
            extra_signed_meta_data: self.extra_signed_metadata.clone(),
        };
        append_document(&mut builder, HEADER_ENTRY, &header_doc)?;

        let mut digest = DigestAccumulator::new();
        for rel in &entries {
            let path = self.source_dir.join(rel);
            let data = std::fs::read(&path)
                .map_err(|e| Error::io_context(format!("cannot read {}", path.display()), e))?;
            let executable = is_executable(&path);
            let mode = if executable { 0o755 } else { 0o644 };

            digest.begin_entry(rel, data.len() as u64, executable);
            digest.update(&data);
            append_file(&mut builder, rel, &data, mode)?;
        }

        let digest = digest.finalize(&self.extra_signed_metadata)?;
        let b64 = base64::engine::general_purpose::STANDARD;
        let (developer_signature, store_signature) = match &self.signing {
            SigningMode::Unsigned => (None, None),
            SigningMode::Developer(key) => {
                (Some(b64.encode(signature::sign(&digest, key))), None)
            }
            SigningMode::Store { key, hardware_id } => {
                let message = match hardware_id {
                    Some(hw) => signature::store_digest(&digest, hw),
                    None => digest.clone(),
                };
                (None, Some(b64.encode(signature::sign(&message, key))))
            }
        };

        let footer_doc = PackageFooter {
            format_type: FOOTER_FORMAT_TYPE.to_string(),
            format_version: FORMAT_VERSION,
            digest: hex::encode(&digest),
            developer_signature,
            store_signature,
        };
        append_document(&mut builder, FOOTER_ENTRY, &footer_doc)?;

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::io_context("cannot finish package archive", e))?;
        let mut file = encoder
            .finish()
            .map_err(|e| Error::io_context("cannot finish package compression", e))?;
        file.flush()
            .map_err(|e| Error::io_context("cannot flush package archive", e))?;
        Ok(())
    }

    /// All regular files below the source directory except manifest and
    /// icon, as sorted relative paths.
    fn collect_payload(&self, info: &PackageInfo) -> Result<Vec<String>> {
        let mut payload = Vec::new();
        for entry in walkdir::WalkDir::new(&self.source_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Filesystem(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.source_dir)
                .map_err(|e| Error::Internal(e.to_string()))?;
            let rel = rel
                .to_str()
                .ok_or_else(|| {
                    Error::Package(format!(
                        "file name {} is not valid UTF-8",
                        rel.display()
                    ))
                })?
                .to_string();
            if rel != MANIFEST_NAME && rel != info.icon {
                payload.push(rel);
            }
        }
        payload.sort();
        Ok(payload)
    }
}

fn append_document<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    doc: &impl serde::Serialize,
) -> Result<()> {
    let data = serde_norway::to_string(doc)?;
    append_file(builder, name, data.as_bytes(), 0o644)
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::io_context(format!("cannot append '{name}' to package"), e))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.permissions().mode() & 0o100 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}
