//! Incremental parsing of a JSON object that arrives one model token at a time.
//!
//! Two separate read paths exist:
//! - [`StreamingJsonParser::partial`] / [`StreamingJsonParser::incremental_property`] close
//!   whatever is still open (strings, objects, arrays) and parse the result. The value is
//!   advisory only and is meant for live display.
//! - [`StreamingJsonParser::json`] parses the accumulated text strictly. It is the only
//!   result that may be acted upon, and only once the stream has finished.

use crate::error::{Result, SproutError};
use serde_json::Value;
use tracing::trace;

#[derive(Debug, Default)]
pub struct StreamingJsonParser {
    raw: String,
    /// Value of the tracked property that has already been handed out.
    emitted: String,
}

impl StreamingJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment to the buffer. Never fails.
    pub fn ingest(&mut self, fragment: &str) {
        self.raw.push_str(fragment);
    }

    /// Everything ingested so far, untouched.
    pub fn raw_input(&self) -> &str {
        &self.raw
    }

    /// The buffer without surrounding whitespace or a surrounding Markdown code fence.
    pub fn input(&self) -> &str {
        let trimmed = self.raw.trim();
        let Some(fenced) = trimmed.strip_prefix("```") else {
            return trimmed;
        };
        // Drop the info string (e.g. "json") on the opening fence line.
        let body = match fenced.find('\n') {
            Some(newline) => &fenced[newline + 1..],
            None => "",
        };
        body.trim_end().trim_end_matches('`').trim()
    }

    /// Best-effort value of the buffer so far, or `None` if it cannot be completed yet.
    pub fn partial(&self) -> Option<Value> {
        let repaired = repair(self.input())?;
        serde_json::from_str(&repaired).ok()
    }

    /// Ingests `fragment`, then returns the part of `extract(partial)` that has not been
    /// returned by an earlier call.
    ///
    /// Concatenating every return value reproduces the extracted string exactly. When the
    /// buffer cannot be repaired, `extract` yields `None`, or the extracted value no longer
    /// extends what was already handed out, the increment is empty.
    pub fn incremental_property<F>(&mut self, fragment: &str, extract: F) -> String
    where
        F: FnOnce(&Value) -> Option<String>,
    {
        self.ingest(fragment);

        let Some(current) = self.partial().as_ref().and_then(extract) else {
            return String::new();
        };

        match current.strip_prefix(self.emitted.as_str()) {
            Some(suffix) => {
                let increment = suffix.to_string();
                self.emitted = current;
                increment
            }
            None => {
                trace!(
                    "Tracked property no longer extends emitted text ({} chars), holding",
                    self.emitted.len()
                );
                String::new()
            }
        }
    }

    /// Strict parse of the complete buffer.
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(self.input())
            .map_err(|e| SproutError::parse(format!("Could not parse JSON: {}", self.input()), e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect {
    Key,
    Colon,
    Value,
    CommaOrClose,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Frame {
    Object(Expect),
    Array(Expect),
}

impl Frame {
    fn expect(&mut self, next: Expect) {
        match self {
            Frame::Object(expect) | Frame::Array(expect) => *expect = next,
        }
    }
}

/// Turns a truncated JSON document into a syntactically complete one.
///
/// Text before the first `{` or `[` is skipped, and text after the top-level value closes is
/// ignored. Open strings are closed (dropping a dangling escape sequence or an unpaired high
/// surrogate), unfinished keys and scalars are dropped, a key without value gets `null`, and
/// every open container is closed. Returns `None` if there is no container to start from.
pub fn repair(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    let text = &text[start..];

    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut string_start = 0;
    let mut escape_start: Option<usize> = None;
    let mut escape_pending = false;
    let mut hex_digits_left = 0u8;
    let mut high_surrogate_start: Option<usize> = None;

    for (index, c) in text.char_indices() {
        if in_string {
            if escape_pending {
                escape_pending = false;
                if c == 'u' {
                    hex_digits_left = 4;
                } else {
                    escape_start = None;
                    high_surrogate_start = None;
                }
                continue;
            }
            if hex_digits_left > 0 {
                hex_digits_left -= 1;
                if hex_digits_left == 0 {
                    let escape = escape_start.take().unwrap_or(index);
                    let code = text
                        .get(escape + 2..index + 1)
                        .and_then(|hex| u16::from_str_radix(hex, 16).ok());
                    high_surrogate_start = match code {
                        Some(0xD800..=0xDBFF) => Some(escape),
                        _ => None,
                    };
                }
                continue;
            }
            match c {
                '\\' => {
                    escape_pending = true;
                    escape_start = Some(index);
                }
                '"' => {
                    in_string = false;
                    high_surrogate_start = None;
                    if let Some(frame) = stack.last_mut() {
                        frame.expect(if string_is_key {
                            Expect::Colon
                        } else {
                            Expect::CommaOrClose
                        });
                    }
                }
                _ => high_surrogate_start = None,
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                string_start = index;
                string_is_key = matches!(stack.last(), Some(Frame::Object(Expect::Key)));
            }
            '{' => stack.push(Frame::Object(Expect::Key)),
            '[' => stack.push(Frame::Array(Expect::Value)),
            '}' | ']' => {
                stack.pop();
                match stack.last_mut() {
                    Some(parent) => parent.expect(Expect::CommaOrClose),
                    None => return Some(text[..index + 1].to_string()),
                }
            }
            ':' => {
                if let Some(frame) = stack.last_mut() {
                    frame.expect(Expect::Value);
                }
            }
            ',' => match stack.last_mut() {
                Some(Frame::Object(expect)) => *expect = Expect::Key,
                Some(Frame::Array(expect)) => *expect = Expect::Value,
                None => {}
            },
            c if c.is_whitespace() => {}
            _ => {
                if let Some(frame) = stack.last_mut() {
                    frame.expect(Expect::CommaOrClose);
                }
            }
        }
    }

    let mut candidate = text.to_string();

    if in_string {
        if string_is_key {
            candidate.truncate(string_start);
        } else {
            let cut = high_surrogate_start
                .or(escape_start)
                .unwrap_or(candidate.len());
            candidate.truncate(cut);
            candidate.push('"');
        }
    } else if matches!(stack.last(), Some(Frame::Object(Expect::Colon))) {
        candidate.push_str(":null");
    }

    loop {
        let trimmed_len = candidate.trim_end().len();
        candidate.truncate(trimmed_len);
        let Some(last) = candidate.chars().last() else {
            break;
        };
        match last {
            ',' => {
                candidate.pop();
            }
            ':' => {
                candidate.push_str("null");
                break;
            }
            c if is_scalar_char(c) => {
                let token_start = candidate
                    .rfind(|c: char| !is_scalar_char(c))
                    .map(|index| index + 1)
                    .unwrap_or(0);
                if serde_json::from_str::<Value>(&candidate[token_start..]).is_ok() {
                    break;
                }
                candidate.truncate(token_start);
            }
            _ => break,
        }
    }

    for frame in stack.iter().rev() {
        candidate.push(match frame {
            Frame::Object(_) => '}',
            Frame::Array(_) => ']',
        });
    }

    Some(candidate)
}

fn is_scalar_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartialConversationTurn;
    use serde_json::json;

    fn user_message(value: &Value) -> Option<String> {
        PartialConversationTurn::user_message_of(value)
    }

    /// Feeds `text` in pieces of the given sizes (cycled) and collects the increments.
    fn stream(text: &str, sizes: &[usize]) -> (Vec<String>, StreamingJsonParser) {
        let mut parser = StreamingJsonParser::new();
        let chars: Vec<char> = text.chars().collect();
        let mut increments = Vec::new();
        let mut position = 0;
        let mut step = 0;
        while position < chars.len() {
            let size = sizes[step % sizes.len()].max(1);
            let end = (position + size).min(chars.len());
            let fragment: String = chars[position..end].iter().collect();
            increments.push(parser.incremental_property(&fragment, user_message));
            position = end;
            step += 1;
        }
        (increments, parser)
    }

    #[test]
    fn test_repair_cases() {
        let cases = [
            (r#"{"a":1"#, json!({"a": 1})),
            (r#"{"a":"x"#, json!({"a": "x"})),
            (r#"{"a":"#, json!({"a": null})),
            (r#"{"a""#, json!({"a": null})),
            (r#"{"a":tr"#, json!({"a": null})),
            (r#"{"a":-"#, json!({"a": null})),
            (r#"{"a":[1,"#, json!({"a": [1]})),
            (r#"{"a":[1, tr"#, json!({"a": [1]})),
            (r#"{"a":1,"#, json!({"a": 1})),
            (r#"{"us"#, json!({})),
            (r#"{"a":1, "b"#, json!({"a": 1})),
            (r#"{"a":{"b":[{"c":"d"#, json!({"a": {"b": [{"c": "d"}]}})),
            (r#"{"a":"x\"#, json!({"a": "x"})),
            (r#"{"a":"x\u00"#, json!({"a": "x"})),
            (r#"{"a":"x\ud83d"#, json!({"a": "x"})),
            (r#"{"a":"x\ud83d\ude"#, json!({"a": "x"})),
            (r#"{"a":"x😀"#, json!({"a": "x😀"})),
            (r#"{"a":"q\"uote"#, json!({"a": "q\"uote"})),
            (r#"{"a":"} not a brace"#, json!({"a": "} not a brace"})),
            ("[", json!([])),
            (r#"{"a":true"#, json!({"a": true})),
        ];

        for (input, expected) in cases {
            let repaired = repair(input).unwrap();
            let value: Value = serde_json::from_str(&repaired)
                .unwrap_or_else(|e| panic!("{input} repaired to invalid {repaired}: {e}"));
            assert_eq!(value, expected, "input: {input}");
        }
    }

    #[test]
    fn test_repair_ignores_surroundings() {
        assert_eq!(repair("no json here"), None);
        assert_eq!(
            repair(r#"Sure! {"a": 1} and then ``"#).as_deref(),
            Some(r#"{"a": 1}"#)
        );
    }

    #[test]
    fn test_char_by_char_revelation_is_exact() {
        let messages = [
            "Done!",
            "Hello there, how are you today?",
            "Quotes \" and \\ backslashes\nand newlines",
            "Unicode: héllo 🌱 and escapes \u{e9}",
            "",
        ];
        for message in messages {
            let full = json!({"userMessage": message, "patch": []}).to_string();
            let (increments, parser) = stream(&full, &[1]);
            assert_eq!(increments.concat(), message, "streaming {full}");
            assert_eq!(parser.json().unwrap(), serde_json::from_str::<Value>(&full).unwrap());
        }
    }

    #[test]
    fn test_escaped_unicode_revelation() {
        let full = r#"{"userMessage": "smile \ud83d\ude00 caf\u00e9", "patch": []}"#;
        for sizes in [&[1][..], &[2, 5, 3], &[7]] {
            let (increments, _) = stream(full, sizes);
            assert_eq!(increments.concat(), "smile 😀 café");
            assert!(increments.iter().all(|i| !i.contains('\\')));
        }
    }

    #[test]
    fn test_patch_before_message() {
        let full = r#"{"patch":[{"op":"replace","path":"/count","value":1}],"userMessage":"Counted."}"#;
        let (increments, parser) = stream(full, &[3, 1, 4]);
        assert_eq!(increments.concat(), "Counted.");
        assert_eq!(parser.json().unwrap()["patch"][0]["value"], json!(1));
    }

    #[test]
    fn test_increments_are_progressive() {
        let full = r#"{"userMessage":"Done!","patch":[]}"#;
        let (increments, _) = stream(full, &[1]);
        let non_empty: Vec<&String> = increments.iter().filter(|i| !i.is_empty()).collect();
        assert_eq!(non_empty, vec!["D", "o", "n", "e", "!"]);
    }

    #[test]
    fn test_rewritten_property_emits_nothing() {
        let mut parser = StreamingJsonParser::new();
        assert_eq!(
            parser.incremental_property(r#"{"userMessage":"Hello"#, user_message),
            "Hello"
        );
        assert_eq!(
            parser.incremental_property(r#"", "userMessage": "Bye"#, user_message),
            ""
        );
    }

    #[test]
    fn test_extract_failure_is_empty_increment() {
        let mut parser = StreamingJsonParser::new();
        assert_eq!(parser.incremental_property(r#"{"userMessage": 4"#, user_message), "");
        assert_eq!(parser.incremental_property("not json", |_| None), "");
    }

    #[test]
    fn test_strict_parse_rejects_malformed() {
        let mut parser = StreamingJsonParser::new();
        parser.ingest(r#"{"userMessage": "hi", "patch": [}"#);
        assert!(matches!(parser.json(), Err(SproutError::Parse { .. })));

        let unfinished = StreamingJsonParser::new();
        assert!(unfinished.json().is_err());

        let mut open = StreamingJsonParser::new();
        open.ingest(r#"{"userMessage": "hi""#);
        assert!(open.partial().is_some());
        assert!(open.json().is_err());
    }

    #[test]
    fn test_input_strips_code_fence() {
        let mut parser = StreamingJsonParser::new();
        parser.ingest("\n```json\n{\"userMessage\": \"hi\", \"patch\": []}\n```\n");
        assert_eq!(parser.input(), r#"{"userMessage": "hi", "patch": []}"#);
        assert_eq!(parser.json().unwrap()["userMessage"], json!("hi"));
        assert!(parser.raw_input().starts_with("\n```json"));
    }
}
