//! Identifier validation.
//!
//! Package ids are reverse-DNS style names. They double as directory
//! names in the installation and document locations, where the `+` and
//! `-` suffixes are reserved for transient sibling directories, so the
//! character set is deliberately strict.

/// Maximum accepted length for a package id.
pub const MAX_PACKAGE_ID_LEN: usize = 150;

/// Checks whether `name` is a valid DNS (or reverse-DNS) name according
/// to RFC 1035/1123, with at least `min_parts` dot-separated labels.
pub fn validate_dns_name(name: &str, min_parts: usize) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < min_parts {
        return false;
    }

    parts.iter().all(|part| {
        let len = part.len();
        if !(1..=63).contains(&len) {
            return false;
        }
        part.bytes().enumerate().all(|(pos, ch)| {
            let edge = pos == 0 || pos == len - 1;
            match ch {
                b'a'..=b'z' | b'0'..=b'9' => true,
                b'-' => !edge,
                _ => false,
            }
        })
    })
}

/// Checks whether `id` can be used as a package id.
///
/// The DNS rule already excludes every filesystem-reserved character
/// (`/ \ : * ? " < > |`), whitespace, and the reserved `+`/`-` sibling
/// markers (a dash is only allowed inside a label).
pub fn is_valid_package_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_PACKAGE_ID_LEN && validate_dns_name(id, 1)
}
