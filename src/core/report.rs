//! Installation reports.
//!
//! Every installed package directory carries a `.installation-report.yaml`
//! summarizing identity, digest, signatures and the extracted file list.
//! The file is three YAML documents: a format header, the report body and
//! a trailing keyed MAC over the serialized header+body. The MAC uses a
//! compiled-in key; it detects local tampering, it is not a security
//! boundary.

use std::collections::BTreeMap;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::core::ids::is_valid_package_id;
use crate::core::yaml;
use crate::error::{Error, Result};

/// Report file name inside every installed package directory.
pub const REPORT_NAME: &str = ".installation-report.yaml";

const FORMAT_TYPE: &str = "am-installation-report";
const FORMAT_VERSION: u32 = 1;

/// Free-form metadata attached to a package by its creator.
pub type MetaMap = BTreeMap<String, serde_norway::Value>;

type HmacSha256 = Hmac<Sha256>;

// Compiled-in tamper-detection key. Regenerate with
//   xxd -i <(dd if=/dev/urandom bs=64 count=1)
// Changing it invalidates every report already on disk.
static REPORT_MAC_KEY: [u8; 64] = [
    0x3b, 0x91, 0x5a, 0xd2, 0x0c, 0x6f, 0xe1, 0x74, 0x88, 0x29, 0xb3, 0x4e, 0xd7, 0x10, 0x95,
    0x6a, 0xc4, 0x5d, 0x3e, 0xf2, 0x81, 0x07, 0x9c, 0x2b, 0x60, 0xaf, 0x14, 0xd8, 0x43, 0xee,
    0x72, 0x09, 0x57, 0xc1, 0x8e, 0x36, 0xfb, 0x64, 0x2d, 0x90, 0x1f, 0xa5, 0x78, 0x0b, 0xce,
    0x53, 0xe9, 0x26, 0xb7, 0x40, 0xdd, 0x6c, 0x12, 0x8f, 0x35, 0xfa, 0x61, 0x04, 0xab, 0x7e,
    0xc9, 0x58, 0x23, 0xe6,
];

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReportHeader {
    format_type: String,
    format_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReportBody {
    package_id: String,
    disk_space_used: u64,
    digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    developer_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    store_signature: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extra_meta_data: MetaMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extra_signed_meta_data: MetaMap,
    files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportMac {
    hmac: String,
}

/// Serialized manifest of one installed package.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstallationReport {
    pub package_id: String,
    pub disk_space_used: u64,
    /// Raw digest over the package payload stream.
    pub digest: Vec<u8>,
    pub developer_signature: Option<Vec<u8>>,
    pub store_signature: Option<Vec<u8>>,
    pub extra_metadata: MetaMap,
    pub extra_signed_metadata: MetaMap,
    /// Relative paths of every extracted file, in extraction order.
    pub files: Vec<String>,
}

impl InstallationReport {
    pub fn new(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            ..Self::default()
        }
    }

    /// A report is valid once id, digest and file list are filled in.
    pub fn is_valid(&self) -> bool {
        is_valid_package_id(&self.package_id) && !self.digest.is_empty() && !self.files.is_empty()
    }

    /// Parses and MAC-verifies a serialized report.
    pub fn load(data: &[u8]) -> Result<Self> {
        let malformed = |why: &str| Error::Package(format!("malformed installation report: {why}"));

        let docs = yaml::parse_documents(data)
            .map_err(|e| malformed(&format!("not parseable as YAML ({e})")))?;
        if docs.len() != 3 {
            return Err(malformed("expected exactly 3 YAML documents"));
        }

        let header: ReportHeader =
            yaml::from_document(&docs[0]).map_err(|_| malformed("invalid format header"))?;
        if header.format_type != FORMAT_TYPE || header.format_version != FORMAT_VERSION {
            return Err(malformed("unsupported format type or version"));
        }

        let body: ReportBody =
            yaml::from_document(&docs[1]).map_err(|_| malformed("invalid report body"))?;
        let mac_doc: ReportMac =
            yaml::from_document(&docs[2]).map_err(|_| malformed("invalid MAC document"))?;

        if body.package_id.is_empty() {
            return Err(malformed("empty package id"));
        }
        if body.disk_space_used == 0 {
            return Err(malformed("diskSpaceUsed must be greater than zero"));
        }
        let digest = hex::decode(&body.digest).map_err(|_| malformed("digest is not hex"))?;
        if digest.is_empty() {
            return Err(malformed("empty digest"));
        }
        if body.files.is_empty() {
            return Err(malformed("empty file list"));
        }

        let stored_mac =
            hex::decode(&mac_doc.hmac).map_err(|_| malformed("stored MAC is not hex"))?;

        // the MAC covers exactly the first two documents, re-serialized
        // in canonical field order
        let signed_part = serialize_signed_part(&header, &body)?;
        let mut mac = HmacSha256::new_from_slice(&REPORT_MAC_KEY)
            .map_err(|e| Error::Internal(e.to_string()))?;
        mac.update(signed_part.as_bytes());
        mac.verify_slice(&stored_mac)
            .map_err(|_| malformed("the report has been tampered with (MAC mismatch)"))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let decode_sig = |sig: &Option<String>| -> Result<Option<Vec<u8>>> {
            match sig {
                None => Ok(None),
                Some(s) => {
                    let bytes = b64
                        .decode(s)
                        .map_err(|_| malformed("signature is not base64"))?;
                    if bytes.is_empty() {
                        return Err(malformed("empty signature"));
                    }
                    Ok(Some(bytes))
                }
            }
        };

        Ok(Self {
            package_id: body.package_id.clone(),
            disk_space_used: body.disk_space_used,
            digest,
            developer_signature: decode_sig(&body.developer_signature)?,
            store_signature: decode_sig(&body.store_signature)?,
            extra_metadata: body.extra_meta_data,
            extra_signed_metadata: body.extra_signed_meta_data,
            files: body.files,
        })
    }

    /// Serializes the report, appending the MAC document.
    ///
    /// Only valid reports can be serialized; see [`Self::is_valid`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if !self.is_valid() {
            return Err(Error::Internal(format!(
                "refusing to serialize an incomplete installation report for '{}'",
                self.package_id
            )));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let header = ReportHeader {
            format_type: FORMAT_TYPE.to_string(),
            format_version: FORMAT_VERSION,
        };
        let body = ReportBody {
            package_id: self.package_id.clone(),
            disk_space_used: self.disk_space_used,
            digest: hex::encode(&self.digest),
            developer_signature: self.developer_signature.as_ref().map(|s| b64.encode(s)),
            store_signature: self.store_signature.as_ref().map(|s| b64.encode(s)),
            extra_meta_data: self.extra_metadata.clone(),
            extra_signed_meta_data: self.extra_signed_metadata.clone(),
            files: self.files.clone(),
        };

        let mut out = serialize_signed_part(&header, &body)?;
        let mut mac = HmacSha256::new_from_slice(&REPORT_MAC_KEY)
            .map_err(|e| Error::Internal(e.to_string()))?;
        mac.update(out.as_bytes());
        let mac_hex = hex::encode(mac.finalize().into_bytes());
        yaml::write_document(&mut out, &ReportMac { hmac: mac_hex })?;
        Ok(out.into_bytes())
    }
}

fn serialize_signed_part(header: &ReportHeader, body: &ReportBody) -> Result<String> {
    let mut out = String::new();
    yaml::write_document(&mut out, header)?;
    yaml::write_document(&mut out, body)?;
    Ok(out)
}
