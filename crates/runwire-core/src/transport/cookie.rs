//! Exact-name cookie lookup.

use percent_encoding::percent_decode_str;

/// Returns the value of cookie `name` from a `Cookie` header (`a=1; b=2`).
///
/// Matching is exact: `csrf` does not match `csrf_token` or `xcsrf`. Values
/// are percent-decoded and stripped of surrounding quotes.
pub fn read_cookie(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key.trim() != name {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some(percent_decode_str(value).decode_utf8_lossy().into_owned())
    })
}
