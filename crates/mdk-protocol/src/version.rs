//! Service version matching.
//!
//! A requested version matches a registered one when the major numbers are
//! equal and the requested minor is not newer than the registered minor.
//! Missing minors count as `0`; patch components are accepted for
//! compatibility but ignored.

fn parse(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    if let Some(patch) = parts.next() {
        patch.parse::<u64>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor))
}

/// Returns `true` if a node registered as `actual` can serve `requested`.
pub fn version_match(requested: &str, actual: &str) -> bool {
    match (parse(requested), parse(actual)) {
        (Some((req_major, req_minor)), Some((act_major, act_minor))) => {
            req_major == act_major && req_minor <= act_minor
        }
        _ => false,
    }
}
