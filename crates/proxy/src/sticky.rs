//! Backend affinity resolution from the `up` override and the affinity cookie

use crate::route::RouteClass;
use once_cell::sync::Lazy;
use regex::Regex;

static SCHEME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[a-z]+://").expect("valid regex"));
static PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+$").expect("valid regex"));

/// Reduce a user-supplied host to a bare hostname.
///
/// Strips a leading scheme, anything from the first `/`, `?` or `#`, and a
/// trailing port.
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let without_scheme = SCHEME.replace(trimmed, "");
    let host = match without_scheme.find(['/', '?', '#']) {
        Some(idx) => &without_scheme[..idx],
        None => &without_scheme[..],
    };
    PORT.replace(host, "").into_owned()
}

/// Pick the sticky preference for a request.
///
/// The explicit override wins on every route. Game routes never consult the
/// cookie, so game traffic cannot disturb control-plane affinity. Returns an
/// empty string when neither source yields a host.
pub fn resolve_sticky(
    override_param: Option<&str>,
    cookie: Option<&str>,
    route: RouteClass,
) -> String {
    let forced = override_param.map(normalize_host).unwrap_or_default();
    if !forced.is_empty() {
        return forced;
    }
    if route.is_restricted() {
        return String::new();
    }
    cookie.map(normalize_host).unwrap_or_default()
}
