//! Version comparison.
//!
//! Package versions are free-form strings. Ordering parses the dotted
//! numeric prefix of both operands and falls back to a lexicographical
//! comparison of the remaining suffixes when the numeric parts tie.

use std::cmp::Ordering;

/// Compares two version strings.
///
/// Returns `-1`, `0` or `1` if `version1` is smaller than, equal to, or
/// greater than `version2` (similar to how `strcmp()` works).
pub fn compare_versions(version1: &str, version2: &str) -> i32 {
    let (segments1, suffix1) = split_version(version1);
    let (segments2, suffix2) = split_version(version2);

    match compare_segments(&segments1, &segments2) {
        Ordering::Less => -1,
        Ordering::Greater => 1,
        Ordering::Equal => match suffix1.cmp(suffix2) {
            Ordering::Less => -1,
            Ordering::Greater => 1,
            Ordering::Equal => 0,
        },
    }
}

/// Splits `s` into its dotted numeric prefix and the remaining suffix.
///
/// `"1.2.3-beta"` parses as `([1, 2, 3], "-beta")`; a string without a
/// leading digit has an empty numeric part and is all suffix.
fn split_version(s: &str) -> (Vec<u64>, &str) {
    let bytes = s.as_bytes();
    let mut segments = Vec::new();
    let mut pos = 0;

    loop {
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == start {
            // no digits here; whatever remains (including a previously
            // consumed '.') belongs to the suffix
            pos = if segments.is_empty() { 0 } else { start - 1 };
            break;
        }

        // numeric segments longer than u64 are clamped, not rejected
        let segment = s[start..pos].parse::<u64>().unwrap_or(u64::MAX);
        segments.push(segment);

        if pos < bytes.len()
            && bytes[pos] == b'.'
            && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)
        {
            pos += 1;
        } else {
            break;
        }
    }

    (segments, &s[pos..])
}

fn compare_segments(a: &[u64], b: &[u64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal() {
        assert_eq!(compare_versions("1.0", "1.0"), 0);
        assert_eq!(compare_versions("", ""), 0);
        assert_eq!(compare_versions("beta", "beta"), 0);
    }

    #[test]
    fn test_numeric_ordering() {
        assert_eq!(compare_versions("1.0", "1.1"), -1);
        assert_eq!(compare_versions("1.9", "1.10"), -1);
        assert_eq!(compare_versions("2", "1.9.9"), 1);
        assert_eq!(compare_versions("1.0.0", "1.0"), 1);
    }

    #[test]
    fn test_suffix_ordering() {
        assert_eq!(compare_versions("1.0-alpha", "1.0-beta"), -1);
        assert_eq!(compare_versions("1.0", "1.0-rc1"), -1);
        assert_eq!(compare_versions("1.0_2", "1.0_1"), 1);
    }

    #[test]
    fn test_non_numeric() {
        assert_eq!(compare_versions("beta", "alpha"), 1);
    }

    #[test]
    fn test_antisymmetry() {
        for (a, b) in [
            ("1.0", "1.1"),
            ("1.0-alpha", "1.0"),
            ("2.0.0", "2"),
            ("x", "y"),
        ] {
            assert_eq!(compare_versions(a, b), -compare_versions(b, a));
            assert_eq!(compare_versions(a, a), 0);
            assert_eq!(compare_versions(b, b), 0);
        }
    }

    #[test]
    fn test_split() {
        assert_eq!(split_version("1.2.3-beta"), (vec![1, 2, 3], "-beta"));
        assert_eq!(split_version("1.2.x"), (vec![1, 2], ".x"));
        assert_eq!(split_version("beta"), (vec![], "beta"));
        assert_eq!(split_version("1."), (vec![1], "."));
    }
}
