//! Package archive wire format.
//!
//! A package is a (usually gzip-compressed) tar stream:
//!
//! ```text
//! --PACKAGE-HEADER--    one YAML document: id, disk space, extra metadata
//! info.yaml             the manifest
//! <icon>                the icon named in the manifest
//! ...                   payload files
//! --PACKAGE-FOOTER--    one YAML document: digest, signatures
//! ```
//!
//! The digest covers every content entry (path, size, executable bit,
//! bytes) in stream order, plus the canonical serialization of the
//! signed extra metadata, so it is reproducible from the unpacked tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::report::MetaMap;
use crate::error::Result;

/// Pseudo entry starting every package.
pub const HEADER_ENTRY: &str = "--PACKAGE-HEADER--";
/// Pseudo entry terminating every package.
pub const FOOTER_ENTRY: &str = "--PACKAGE-FOOTER--";

/// Icons may not exceed this size.
pub const MAX_ICON_SIZE: u64 = 256 * 1024;

pub(crate) const HEADER_FORMAT_TYPE: &str = "am-package-header";
pub(crate) const FOOTER_FORMAT_TYPE: &str = "am-package-footer";
pub(crate) const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageHeader {
    pub format_type: String,
    pub format_version: u32,
    pub package_id: String,
    pub disk_space_used: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_meta_data: MetaMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_signed_meta_data: MetaMap,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageFooter {
    pub format_type: String,
    pub format_version: u32,
    /// Hex-encoded payload digest.
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_signature: Option<String>,
}

/// Incremental digest over the package content stream.
///
/// Both the extractor and the builder must feed it identically or
/// digests will never match.
pub(crate) struct DigestAccumulator {
    hasher: Sha256,
}

impl DigestAccumulator {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Starts a content entry: relative path, size and executable bit.
    pub fn begin_entry(&mut self, relative_path: &str, size: u64, executable: bool) {
        self.hasher.update(relative_path.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(size.to_le_bytes());
        self.hasher.update([u8::from(executable)]);
    }

    /// Feeds a chunk of the current entry's content.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Mixes in the signed extra metadata and finalizes.
    pub fn finalize(mut self, extra_signed_metadata: &MetaMap) -> Result<Vec<u8>> {
        if !extra_signed_metadata.is_empty() {
            self.hasher
                .update(serde_norway::to_string(extra_signed_metadata)?.as_bytes());
        }
        Ok(self.hasher.finalize().to_vec())
    }
}
