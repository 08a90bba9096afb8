use crate::serial::protocol::STAT_HEADER;

/// Parse a stat block header.
/// Format: `stat <name>`; the name is the second whitespace token,
/// `unknown` when missing
pub fn parse_stat_header(text: &str) -> Option<String> {
    if !text.contains(STAT_HEADER) {
        return None;
    }
    let name = text.split_whitespace().nth(1).unwrap_or("unknown");
    Some(name.to_string())
}

/// Parse a stat body line.
/// Format: `<key>: <integer>`
pub fn parse_stat_field(text: &str) -> Option<(String, i64)> {
    let mut parts = text.split_whitespace();
    let key = parts.next()?.trim_end_matches(':');
    let value = parts.next()?.parse::<i64>().ok()?;
    Some((key.to_string(), value))
}

/// Firmware version from an image banner line: tokens 1 to 4 joined
pub fn parse_version_banner(text: &str) -> String {
    text.split_whitespace().skip(1).take(4).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_header() {
        assert_eq!(parse_stat_header("stat mac").as_deref(), Some("mac"));
        assert_eq!(parse_stat_header("stat "), Some("unknown".to_string()));
        assert_eq!(parse_stat_header("stats mac"), None);
        assert_eq!(parse_stat_header("rx_ok: 3"), None);
    }

    #[test]
    fn test_parse_stat_field() {
        assert_eq!(parse_stat_field("rx_ok: 12"), Some(("rx_ok".to_string(), 12)));
        assert_eq!(parse_stat_field("neg: -4"), Some(("neg".to_string(), -4)));
        assert_eq!(parse_stat_field("name: mac"), None);
        assert_eq!(parse_stat_field("lonely"), None);
        assert_eq!(parse_stat_field(""), None);
    }

    #[test]
    fn test_parse_version_banner() {
        let v = parse_version_banner("img abc 1.2.3 deadbeef 2023-01-01 extra tail");
        assert_eq!(v, "abc 1.2.3 deadbeef 2023-01-01");
    }
}
