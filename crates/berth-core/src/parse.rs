//! Parsing helpers for human-facing configuration values.

/// Parse a memory size like "256M", "2G", "512K". A bare number is
/// megabytes.
pub fn parse_memory(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], c.to_ascii_uppercase()),
        _ => (s, 'M'),
    };

    let value: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        'K' => 1024,
        'M' => 1024 * 1024,
        'G' => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Current unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_units() {
        assert_eq!(parse_memory("512K"), Some(512 * 1024));
        assert_eq!(parse_memory("256M"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory("2G"), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn parse_memory_bare_number_is_megabytes() {
        assert_eq!(parse_memory("64"), Some(64 * 1024 * 1024));
    }

    #[test]
    fn parse_memory_lowercase_unit() {
        assert_eq!(parse_memory("128m"), Some(128 * 1024 * 1024));
    }

    #[test]
    fn parse_memory_rejects_garbage() {
        assert_eq!(parse_memory(""), None);
        assert_eq!(parse_memory("abc"), None);
        assert_eq!(parse_memory("12T"), None);
    }
}
