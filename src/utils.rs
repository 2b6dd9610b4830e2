use std::net::IpAddr;

/// Splits an intercepted dial address into its host and port portions.
///
/// Returns `None` for every address shape the interceptor must leave alone:
/// bracketed IPv6 literals (with or without a port), bare or ported IPv4/IPv6
/// literals, addresses without a port, and addresses with a trailing colon.
/// The port is kept as a string because it is only ever used to derive an SRV
/// service label, never to connect.
pub(crate) fn extract_host_port(address: &str) -> Option<(String, String)> {
    if address.is_empty() || address.starts_with('[') {
        return None;
    }
    let colon = address.rfind(':')?;
    if colon < 1 || colon + 1 == address.len() {
        return None;
    }
    let host = &address[..colon];
    let port = &address[colon + 1..];
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    Some((host.to_string(), port.to_string()))
}

/// Truncates a string for display on the status page, appending an ellipsis.
pub(crate) fn trim_to(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return "...".to_string();
    }
    let mut out: String = s.chars().take(max - 3).collect();
    out.push_str("...");
    out
}
