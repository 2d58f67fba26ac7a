//! Multi-document YAML helpers.
//!
//! Manifests, installation reports and the package header/footer all
//! use small streams of YAML documents separated by `---` markers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_norway::Value;

use crate::error::{Error, Result};

/// Parses every document in `data`.
pub fn parse_documents(data: &[u8]) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for document in serde_norway::Deserializer::from_slice(data) {
        docs.push(Value::deserialize(document)?);
    }
    Ok(docs)
}

/// Converts a parsed document into a typed value.
pub fn from_document<T: DeserializeOwned>(doc: &Value) -> Result<T> {
    serde_norway::from_value(doc.clone()).map_err(Error::from)
}

/// Appends `doc` to `out` as one `---`-prefixed YAML document.
///
/// Serialization order follows the struct definition, so the output is
/// deterministic and can be fed to a MAC.
pub fn write_document<T: Serialize>(out: &mut String, doc: &T) -> Result<()> {
    out.push_str("---\n");
    out.push_str(&serde_norway::to_string(doc)?);
    Ok(())
}
