//! Structured-output interpretation for model responses.
//!
//! Implements the contract between raw model text and a judgment
//! `{choice, reason, self_judgment}`, including the repair ladder used for
//! malformed output both inline and by the offline repair pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum stored reason length, in characters.
pub const MAX_REASON_CHARS: usize = 200;

pub const VALID_CHOICES: [&str; 4] = ["A", "B", "C", "D"];

static STANDALONE_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([ABCD])\b").expect("Invalid standalone letter regex"));

static LEADING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*```(?:json)?\s*").expect("Invalid leading fence regex"));

static TRAILING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*```\s*$").expect("Invalid trailing fence regex"));

// Last resort only: mishandles nested objects.
static NON_GREEDY_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*?\}").expect("Invalid object regex"));

// =============================================================================
// Types
// =============================================================================

/// Normalized judgment extracted from a model response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    pub choice: String,
    pub reason: String,
    pub self_judgment: String,
}

/// Result of interpreting one raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(Judgment),
    Failed { message: String, raw: String },
}

impl ParseOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }
}

/// Which rung of the repair ladder produced a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairMethod {
    /// Code fences stripped, then decoded directly.
    CleanStrip,
    /// First balanced `{...}` block decoded.
    ExtractFirstJson,
    /// Decoded after unescaping `\"`, `\uXXXX` and friends.
    Unescape,
}

impl RepairMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairMethod::CleanStrip => "clean_strip",
            RepairMethod::ExtractFirstJson => "extract_first_json",
            RepairMethod::Unescape => "unescape",
        }
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Interpret a raw model output: direct decode first, then the repair ladder.
///
/// On total failure the message of the direct decode error is reported.
pub fn parse_response(raw: &str) -> ParseOutcome {
    let direct_err = match decode_judgment(raw.trim()) {
        Ok(judgment) => return ParseOutcome::Parsed(judgment),
        Err(e) => e,
    };

    match repair_output(raw) {
        Ok((judgment, _)) => ParseOutcome::Parsed(judgment),
        Err(_) => ParseOutcome::Failed {
            message: direct_err,
            raw: raw.to_string(),
        },
    }
}

/// Run the repair ladder on a raw output.
///
/// Returns the judgment and the rung that decoded it, or the last decode error.
pub fn repair_output(raw: &str) -> Result<(Judgment, RepairMethod), String> {
    let cleaned = strip_code_fences(raw);

    let mut last_err = match decode_judgment(&cleaned) {
        Ok(judgment) => return Ok((judgment, RepairMethod::CleanStrip)),
        Err(e) => e,
    };

    let candidate = extract_first_json(&cleaned);
    if let Some(block) = candidate {
        match decode_judgment(block) {
            Ok(judgment) => return Ok((judgment, RepairMethod::ExtractFirstJson)),
            Err(e) => last_err = e,
        }
    }

    let targets = candidate.into_iter().chain(std::iter::once(cleaned.as_str()));
    for target in targets {
        let unescaped = unescape_common(target);
        if unescaped == target {
            continue;
        }
        match decode_judgment(&unescaped) {
            Ok(judgment) => return Ok((judgment, RepairMethod::Unescape)),
            Err(e) => last_err = e,
        }
        if let Some(block) = extract_first_json(&unescaped) {
            match decode_judgment(block) {
                Ok(judgment) => return Ok((judgment, RepairMethod::Unescape)),
                Err(e) => last_err = e,
            }
        }
    }

    Err(last_err)
}

/// Decode a JSON object into a normalized judgment.
pub fn decode_judgment(text: &str) -> Result<Judgment, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, got {}", json_kind(&value)))?;
    Ok(judgment_from_object(obj))
}

/// Build a judgment from a decoded object, normalizing every field.
///
/// Non-string fields read as empty; `predicted_*` names are accepted as aliases.
pub fn judgment_from_object(obj: &Map<String, Value>) -> Judgment {
    let field = |primary: &str, alias: &str| -> String {
        obj.get(primary)
            .or_else(|| obj.get(alias))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Judgment {
        choice: normalize_choice(&field("choice", "predicted_choice")),
        reason: truncate_reason(&field("reason", "predicted_reason")),
        self_judgment: normalize_self_judgment(&field("self_judgment", "predicted_self_judgment")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// Field normalization
// =============================================================================

/// Upper-case and validate a choice; forms like "Option A." reduce to "A".
pub fn normalize_choice(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if VALID_CHOICES.contains(&upper.as_str()) {
        return upper;
    }
    extract_standalone_letter(&upper).unwrap_or_default()
}

pub fn truncate_reason(raw: &str) -> String {
    raw.trim().chars().take(MAX_REASON_CHARS).collect()
}

/// Lower-cased, otherwise left as-is.
pub fn normalize_self_judgment(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// First standalone `A`-`D` token. Callers upper-case the text first.
pub fn extract_standalone_letter(text: &str) -> Option<String> {
    STANDALONE_LETTER
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

// =============================================================================
// Repair helpers
// =============================================================================

/// Strip a leading ```` ```json ```` / ```` ``` ```` fence and a trailing ```` ``` ````.
pub fn strip_code_fences(raw: &str) -> String {
    let s = LEADING_FENCE.replace(raw, "");
    let s = TRAILING_FENCE.replace(&s, "");
    s.trim().to_string()
}

/// First balanced brace-delimited block, by depth counting from the first `{`.
pub fn extract_first_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let remainder = &text[start..];

    let mut depth = 0usize;
    for (i, c) in remainder.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }

    NON_GREEDY_OBJECT.find(remainder).map(|m| m.as_str())
}

/// Unescape common backslash sequences, including `\uXXXX` surrogate pairs.
///
/// Unknown or malformed escapes are kept verbatim.
pub fn unescape_common(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != '\\' || i + 1 >= chars.len() {
            out.push(c);
            i += 1;
            continue;
        }

        let next = chars[i + 1];
        let simple = match next {
            '"' => Some('"'),
            '\\' => Some('\\'),
            '/' => Some('/'),
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            _ => None,
        };
        if let Some(ch) = simple {
            out.push(ch);
            i += 2;
            continue;
        }

        if next == 'u' {
            if let Some(high) = hex4(&chars, i + 2) {
                if (0xD800..0xDC00).contains(&high) {
                    let low = (chars.get(i + 6) == Some(&'\\') && chars.get(i + 7) == Some(&'u'))
                        .then(|| hex4(&chars, i + 8))
                        .flatten()
                        .filter(|low| (0xDC00..0xE000).contains(low));
                    if let Some(low) = low {
                        let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                        if let Some(ch) = char::from_u32(code) {
                            out.push(ch);
                            i += 12;
                            continue;
                        }
                    }
                } else if let Some(ch) = char::from_u32(high) {
                    out.push(ch);
                    i += 6;
                    continue;
                }
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

fn hex4(chars: &[char], start: usize) -> Option<u32> {
    let digits = chars.get(start..start + 4)?;
    digits
        .iter()
        .try_fold(0u32, |acc, ch| ch.to_digit(16).map(|d| acc * 16 + d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let raw = r#"{"choice": "b", "reason": " short ", "self_judgment": "Correct"}"#;
        match parse_response(raw) {
            ParseOutcome::Parsed(j) => {
                assert_eq!(j.choice, "B");
                assert_eq!(j.reason, "short");
                assert_eq!(j.self_judgment, "correct");
            }
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn fenced_block_parses_via_clean_strip() {
        let raw = "```json\n{\"choice\":\"A\",\"reason\":\"x\",\"self_judgment\":\"correct\"}\n```";
        let (judgment, method) = repair_output(raw).unwrap();
        assert_eq!(judgment.choice, "A");
        assert_eq!(method, RepairMethod::CleanStrip);
        assert!(parse_response(raw).is_parsed());
    }

    #[test]
    fn nested_braces_extracted_by_depth_scan() {
        let raw = r#"Sure! {"choice":"C","reason":"see {inner}","self_judgment":"incorrect","meta":{"k":1}} trailing"#;
        let (judgment, method) = repair_output(raw).unwrap();
        assert_eq!(method, RepairMethod::ExtractFirstJson);
        assert_eq!(judgment.choice, "C");
        assert_eq!(judgment.reason, "see {inner}");
    }

    #[test]
    fn extract_first_json_returns_balanced_block() {
        let text = r#"noise {"a":{"b":{"c":1}}} {"d":2}"#;
        assert_eq!(extract_first_json(text), Some(r#"{"a":{"b":{"c":1}}}"#));
        assert_eq!(extract_first_json("no braces"), None);
    }

    #[test]
    fn unclosed_block_falls_back_to_non_greedy_match() {
        let text = r#"{"outer": {"choice":"A"} and never closed"#;
        assert_eq!(extract_first_json(text), Some(r#"{"outer": {"choice":"A"}"#));
    }

    #[test]
    fn escaped_json_decodes_after_unescape() {
        let raw = r#"{\"choice\": \"D\", \"reason\": \"小\", \"self_judgment\": \"correct\"}"#;
        let (judgment, method) = repair_output(raw).unwrap();
        assert_eq!(method, RepairMethod::Unescape);
        assert_eq!(judgment.choice, "D");
        assert_eq!(judgment.reason, "小");
    }

    #[test]
    fn unescape_handles_surrogate_pairs_and_unknown_escapes() {
        assert_eq!(unescape_common(r"\ud83d\ude00"), "\u{1F600}");
        assert_eq!(unescape_common(r"\u5c0f\n"), "小\n");
        assert_eq!(unescape_common(r"a\qb"), r"a\qb");
        assert_eq!(unescape_common(r"tail\"), r"tail\");
    }

    #[test]
    fn broken_output_reports_direct_decode_error() {
        let raw = "I think the answer is A but json broke";
        match parse_response(raw) {
            ParseOutcome::Failed { message, raw: kept } => {
                assert!(!message.is_empty());
                assert_eq!(kept, raw);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(
            extract_standalone_letter(&raw.to_uppercase()).as_deref(),
            Some("A")
        );
    }

    #[test]
    fn non_object_json_is_a_parse_error() {
        assert!(decode_judgment("\"A\"").is_err());
        assert!(decode_judgment("[1,2]").is_err());
    }

    #[test]
    fn choice_normalization() {
        assert_eq!(normalize_choice(" c "), "C");
        assert_eq!(normalize_choice("Option A."), "A");
        assert_eq!(normalize_choice("(b)"), "B");
        assert_eq!(normalize_choice("E"), "");
        assert_eq!(normalize_choice(""), "");
    }

    #[test]
    fn non_string_fields_read_as_empty() {
        let j = decode_judgment(r#"{"choice": 1, "reason": null, "self_judgment": true}"#).unwrap();
        assert_eq!(j, Judgment::default());
    }

    #[test]
    fn reason_truncated_to_200_chars() {
        let long = "理".repeat(250);
        let raw = format!(r#"{{"choice":"A","reason":"{long}","self_judgment":"correct"}}"#);
        match parse_response(&raw) {
            ParseOutcome::Parsed(j) => assert_eq!(j.reason.chars().count(), MAX_REASON_CHARS),
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn self_judgment_not_coerced() {
        let j = decode_judgment(r#"{"choice":"A","reason":"","self_judgment":"Maybe"}"#).unwrap();
        assert_eq!(j.self_judgment, "maybe");
    }

    #[test]
    fn aliases_accepted_when_primary_missing() {
        let j = decode_judgment(r#"{"predicted_choice":"b","predicted_reason":"r"}"#).unwrap();
        assert_eq!(j.choice, "B");
        assert_eq!(j.reason, "r");
    }
}
