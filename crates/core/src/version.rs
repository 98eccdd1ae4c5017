//! Resource version ordering.
//!
//! Versions are opaque strings. Kubernetes hands out etcd revisions which parse
//! as integers, so those are ordered numerically; anything else can only be
//! compared for equality.

use std::cmp::Ordering;

/// Compare two versions; `None` when they differ but cannot be ordered.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => Some(x.cmp(&y)),
        _ => None,
    }
}

/// Whether `candidate` should replace an entry currently at `current`.
///
/// A missing current version always accepts (first seen). A candidate without
/// a version cannot be proven stale and is accepted too.
pub fn is_newer(candidate: Option<&str>, current: Option<&str>) -> bool {
    match (candidate, current) {
        (_, None) | (None, _) => true,
        (Some(c), Some(cur)) => !matches!(compare(c, cur), Some(Ordering::Less | Ordering::Equal)),
    }
}
