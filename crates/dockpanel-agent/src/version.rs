use std::cmp::Ordering;

use semver::Version;

pub fn parse_version(tag: &str) -> Option<Version> {
    let trimmed = tag.trim().strip_prefix('v').unwrap_or(tag.trim());
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = Version::parse(trimmed) {
        return Some(v);
    }

    // Support "major.minor" and "major" tags by coercing to semver.
    let parts = trimmed.split('.').collect::<Vec<_>>();
    let coerced = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => return None,
    };
    Version::parse(&coerced).ok()
}

/// Orders two app versions. Falls back to a numeric segment walk when either side is not semver
/// (e.g. `8.0.35.1` or `2024.01`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if let (Some(va), Some(vb)) = (parse_version(a), parse_version(b)) {
        return va.cmp(&vb);
    }
    let seg = |s: &str| -> Vec<String> {
        s.trim()
            .trim_start_matches('v')
            .split(['.', '-', '_'])
            .map(str::to_string)
            .collect()
    };
    let (sa, sb) = (seg(a), seg(b));
    for i in 0..sa.len().max(sb.len()) {
        let x = sa.get(i).map(String::as_str).unwrap_or("0");
        let y = sb.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// `true` when `new` is strictly greater than `old`.
pub fn is_newer(new: &str, old: &str) -> bool {
    compare_versions(new, old) == Ordering::Greater
}

/// Different leading segment, e.g. `5.7.44` vs `8.0.35`.
pub fn is_cross_version(a: &str, b: &str) -> bool {
    first_segment(a) != first_segment(b)
}

fn first_segment(v: &str) -> &str {
    let v = v.trim().trim_start_matches('v');
    v.split('.').next().unwrap_or(v)
}

/// `X.Y` prefix used to pin mysql upgrades to the same major line.
pub fn major_minor(v: &str) -> String {
    let v = v.trim().trim_start_matches('v');
    let mut parts = v.split('.');
    match (parts.next(), parts.next()) {
        (Some(x), Some(y)) => format!("{x}.{y}"),
        (Some(x), None) => x.to_string(),
        _ => v.to_string(),
    }
}

pub fn sort_desc(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_versions(b, a));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_semver_and_coerced() {
        assert_eq!(compare_versions("5.10", "5.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.2.3", "1.2.3"), Ordering::Equal);
        assert!(is_newer("8.0.36", "8.0.35"));
    }

    #[test]
    fn falls_back_to_segments() {
        assert_eq!(compare_versions("8.0.35.1", "8.0.35"), Ordering::Greater);
        assert_eq!(compare_versions("2024.01.02.3", "2024.01.10.1"), Ordering::Less);
    }

    #[test]
    fn cross_version_and_major() {
        assert!(is_cross_version("5.7.44", "8.0.35"));
        assert!(!is_cross_version("8.0.35", "8.4.0"));
        assert_eq!(major_minor("8.0.35"), "8.0");
        assert_eq!(major_minor("latest"), "latest");
    }

    #[test]
    fn sorts_descending() {
        let mut v = vec!["1.2".to_string(), "1.10".to_string(), "1.9.1".to_string()];
        sort_desc(&mut v);
        assert_eq!(v, vec!["1.10", "1.9.1", "1.2"]);
    }
}
