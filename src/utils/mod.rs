/// Utility functions and helpers
use std::fmt::Write;
use std::time::Duration;

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

/// Greatest common divisor; `gcd(0, n) == n`
pub fn gcd(a: u32, b: u32) -> u32 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Split `host:port`, requiring a non-empty host and a numeric port
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

/// Encode a key as `application/x-www-form-urlencoded`.
///
/// ASCII alphanumerics and `.-*_` pass through, space becomes `+`, every other
/// UTF-8 byte becomes `%XX`.
pub fn sanitize_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'*' | b'_' => encoded.push(byte as char),
            b' ' => encoded.push('+'),
            other => {
                let _ = write!(encoded, "%{:02X}", other);
            }
        }
    }
    encoded
}

/// Whether a key can be sent on the text protocol as-is
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && !key.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Convert an absolute expiry in epoch milliseconds to protocol seconds; 0 stays 0
pub fn expiry_seconds(expires_at_ms: u64) -> u32 {
    u32::try_from(expires_at_ms / 1000).unwrap_or(u32::MAX)
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 && duration.subsec_millis() > 0 {
        format!("{}ms", duration.subsec_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format byte size for human-readable output
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
