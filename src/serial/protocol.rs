use serde_json::{Map, Value};

/// Console prompt echoed by the firmware shell
pub const PROMPT_TOKEN: &str = "compat> ";
/// Substring marking a line logged at error severity
pub const ERROR_MARKER: &str = "level=3";
/// Substring present in the firmware image version banner
pub const VERSION_MARKER: &str = " abc ";
/// Header token that opens a stat block
pub const STAT_HEADER: &str = "stat ";

/// Outcome of decoding a single protocol line
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    /// The line carried a JSON object
    Record { fields: Map<String, Value>, line: String },
    /// Free text; `line` is the trimmed original
    Raw { line: String },
}

impl DecodedLine {
    /// The trimmed original text, whichever way it decoded
    pub fn line(&self) -> &str {
        match self {
            DecodedLine::Record { line, .. } => line,
            DecodedLine::Raw { line } => line,
        }
    }
}

/// Split a leading `<digits> ` tick counter off a trimmed line
pub fn split_ticks(line: &str) -> (Option<u64>, &str) {
    let digits = line.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || line.as_bytes().get(digits) != Some(&b' ') {
        return (None, line);
    }
    match line[..digits].parse::<u64>() {
        Ok(ticks) => (Some(ticks), &line[digits + 1..]),
        Err(_) => (None, line),
    }
}

/// Remove transport noise: tick counter, shell prompt and NUL bytes.
/// Returns the tick counter (if any) and the cleaned text.
pub fn strip_noise(line: &str) -> (Option<u64>, String) {
    let (ticks, rest) = split_ticks(line.trim());
    let cleaned = rest.replace(PROMPT_TOKEN, "").replace('\0', "");
    (ticks, cleaned)
}

/// Decode one line, falling back to raw text when it is not a JSON object
pub fn decode_line(line: &str) -> DecodedLine {
    let trimmed = line.trim();
    let (_, cleaned) = strip_noise(trimmed);

    match serde_json::from_str::<Value>(cleaned.trim()) {
        Ok(Value::Object(fields)) => DecodedLine::Record { fields, line: trimmed.to_string() },
        Ok(_) | Err(_) => DecodedLine::Raw { line: trimmed.to_string() },
    }
}

/// Stateless decoder wrapper used by reader tasks
#[derive(Debug, Default, Clone, Copy)]
pub struct LineProtocolDecoder;

impl LineProtocolDecoder {
    pub fn decode(&self, line: &str) -> DecodedLine {
        decode_line(line)
    }
}

/// Commands for a full stat dump: wake line, one `stat <n>` per category,
/// and a closing `stat stat` so the generic counters are always captured.
pub fn stat_dump_commands<S: AsRef<str>>(categories: &[S]) -> Vec<String> {
    let mut cmds = vec![String::new()];
    cmds.extend(categories.iter().map(|n| format!("stat {}", n.as_ref())));
    cmds.push("stat stat".to_string());
    cmds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ticks() {
        assert_eq!(split_ticks("1234 stat mac"), (Some(1234), "stat mac"));
        assert_eq!(split_ticks("stat mac"), (None, "stat mac"));
        assert_eq!(split_ticks("12ab stat"), (None, "12ab stat"));
        assert_eq!(split_ticks("42"), (None, "42"));
    }

    #[test]
    fn test_strip_noise_removes_prompt_and_nul() {
        let (ticks, text) = strip_noise("  77 compat> stat\0 pan \r");
        assert_eq!(ticks, Some(77));
        assert_eq!(text, "stat pan");
    }

    #[test]
    fn test_decode_json_record() {
        match decode_line("1200 compat> {\"euid\": \"0x1\", \"x\": 3}\r\n") {
            DecodedLine::Record { fields, line } => {
                assert_eq!(fields["x"], 3);
                assert!(line.starts_with("1200 compat>"));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_falls_back_to_raw() {
        let decoded = decode_line("  rx: 12  ");
        assert_eq!(decoded, DecodedLine::Raw { line: "rx: 12".to_string() });

        // Valid JSON that is not an object is still raw text
        assert!(matches!(decode_line("42 17"), DecodedLine::Raw { .. }));
        assert!(matches!(decode_line("{\"broken\": "), DecodedLine::Raw { .. }));
    }

    #[test]
    fn test_stat_dump_commands() {
        let cmds = stat_dump_commands(&["ccp", "mac"]);
        assert_eq!(cmds, vec!["", "stat ccp", "stat mac", "stat stat"]);
        let none: [&str; 0] = [];
        assert_eq!(stat_dump_commands(&none), vec!["", "stat stat"]);
    }
}
