//! Splitting of `host[:port]` target strings.

/// Splits a target string into host and optional port parts.
///
/// Handles `host`, `host:port`, `[ipv6]`, and `[ipv6]:port`. An unbracketed
/// string containing more than one colon is taken to be a bare IPv6 literal
/// with no port. Returns `None` when the string cannot be split (empty host,
/// unterminated bracket, or trailing garbage after a bracket).
pub(crate) fn split_host_port(name: &str) -> Option<(String, Option<String>)> {
    if let Some(rest) = name.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        if host.is_empty() {
            return None;
        }
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Some((host.to_string(), None));
        }
        let port = after.strip_prefix(':')?;
        return Some((host.to_string(), Some(port.to_string())));
    }
    match name.rfind(':') {
        Some(idx) if !name[..idx].contains(':') => {
            let host = &name[..idx];
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), Some(name[idx + 1..].to_string())))
        }
        // More than one colon without brackets: bare IPv6 literal.
        Some(_) => Some((name.to_string(), None)),
        None => {
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), None))
        }
    }
}
