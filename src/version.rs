// src/version.rs

use std::cmp::Ordering;

/// Strip a leading `v` and surrounding whitespace.
pub fn normalize(version: &str) -> &str {
    version.trim().trim_start_matches('v')
}

/// Parse a dotted version string into numeric parts (e.g. "1.4.0" -> [1, 4, 0]).
/// Non-numeric components are skipped.
pub fn parse_parts(version: &str) -> Vec<u32> {
    normalize(version)
        .split('.')
        .filter_map(|part| part.parse::<u32>().ok())
        .collect()
}

/// Compare two dotted version strings component-wise.
/// Missing components compare as 0, so "1.4" == "1.4.0".
pub fn compare(a: &str, b: &str) -> Ordering {
    let parts_a = parse_parts(a);
    let parts_b = parse_parts(b);
    let max_len = parts_a.len().max(parts_b.len());

    for i in 0..max_len {
        let a_part = parts_a.get(i).copied().unwrap_or(0);
        let b_part = parts_b.get(i).copied().unwrap_or(0);
        match a_part.cmp(&b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// True when `remote` is strictly newer than `local`.
pub fn is_newer(remote: &str, local: &str) -> bool {
    compare(remote, local) == Ordering::Greater
}
