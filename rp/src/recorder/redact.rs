//! Secret redaction and text truncation for recorded events

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::events::{EventKind, RunEvent};

/// Placeholder substituted for sensitive values
pub const REDACTED: &str = "***REDACTED***";

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    // OpenAI-like keys
    (r"sk-[A-Za-z0-9]{20,}", "sk-***REDACTED***"),
    (r"(?i)api_key=[A-Za-z0-9_-]{10,}", "api_key=***REDACTED***"),
    (r"(?i)(Authorization:\s*Bearer\s+)[A-Za-z0-9._-]+", "${1}***REDACTED***"),
    (
        r"(OPENAI_API_KEY|ANTHROPIC_API_KEY|AZURE_OPENAI_KEY)=\S+",
        "${1}=***REDACTED***",
    ),
];

const DEFAULT_KEYS: &[&str] = &["apiKey", "password", "token", "authorization", "secret"];

/// Extra substitution applied after the built-in patterns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
}

fn default_replacement() -> String {
    REDACTED.to_string()
}

/// Redaction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RedactionConfig {
    pub enabled: bool,
    pub extra_patterns: Vec<PatternRule>,
    /// Object keys whose values are replaced wholesale (case-insensitive)
    pub extra_keys: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_patterns: Vec::new(),
            extra_keys: Vec::new(),
        }
    }
}

/// Compiled redaction rules
#[derive(Debug, Clone)]
pub struct Redactor {
    enabled: bool,
    patterns: Vec<(Regex, String)>,
    keys: Vec<String>,
}

static SHARED: LazyLock<Redactor> = LazyLock::new(Redactor::default);

impl Default for Redactor {
    fn default() -> Self {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(re) => Some((re, replacement.to_string())),
                Err(e) => {
                    warn!(pattern, error = %e, "Redactor: skipping built-in pattern");
                    None
                }
            })
            .collect();
        Self {
            enabled: true,
            patterns,
            keys: DEFAULT_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl Redactor {
    /// Build a redactor from config; fails with Validation on a bad extra pattern
    pub fn new(config: &RedactionConfig) -> Result<Self, RunError> {
        let mut redactor = Self::default();
        redactor.enabled = config.enabled;
        for rule in &config.extra_patterns {
            let re = Regex::new(&rule.pattern)
                .map_err(|e| RunError::Validation(format!("Invalid redaction pattern {:?}: {}", rule.pattern, e)))?;
            redactor.patterns.push((re, rule.replacement.clone()));
        }
        redactor.keys.extend(config.extra_keys.iter().cloned());
        debug!(
            enabled = redactor.enabled,
            patterns = redactor.patterns.len(),
            keys = redactor.keys.len(),
            "Redactor::new"
        );
        Ok(redactor)
    }

    /// Process-wide redactor with the built-in rules
    pub fn shared() -> &'static Redactor {
        &SHARED
    }

    /// A redactor that passes everything through
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    /// Mask every secret-shaped substring
    pub fn redact_str(&self, input: &str) -> String {
        if !self.enabled {
            return input.to_string();
        }
        let mut out = input.to_string();
        for (re, replacement) in &self.patterns {
            out = re.replace_all(&out, replacement.as_str()).into_owned();
        }
        out
    }

    /// Deep-redact a JSON value in place
    pub fn redact_value(&self, value: &mut Value) {
        if !self.enabled {
            return;
        }
        match value {
            Value::String(s) => {
                let redacted = self.redact_str(s);
                if redacted != *s {
                    *s = redacted;
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact_value(v)),
            Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if self.is_sensitive_key(key) && !v.is_null() {
                        *v = Value::String(REDACTED.to_string());
                    } else {
                        self.redact_value(v);
                    }
                }
            }
            _ => {}
        }
    }

    /// Redact an event's payload, producing a new event
    ///
    /// Envelope fields are left untouched. When masking a sensitive key turns a
    /// typed field into a string the payload no longer matches its variant; the
    /// event is then redacted string by string, skipping only replacements the
    /// variant cannot hold.
    pub fn redact_event(&self, event: &RunEvent) -> RunEvent {
        if !self.enabled {
            return event.clone();
        }
        let original = match serde_json::to_value(event.kind()) {
            Ok(v) => v,
            Err(e) => {
                warn!(event_type = %event.event_type(), error = %e, "Redactor: failed to encode event");
                return event.clone();
            }
        };

        let mut value = original.clone();
        if let Some(payload) = value.get_mut("payload") {
            self.redact_value(payload);
        }
        match serde_json::from_value::<EventKind>(value) {
            Ok(kind) => event.with_kind(kind),
            Err(e) => {
                warn!(event_type = %event.event_type(), error = %e, "Redactor: redacted payload no longer parses, masking strings only");
                event.with_kind(self.redact_strings(event.kind(), original))
            }
        }
    }

    /// Apply string replacements one at a time, keeping each one the variant still accepts
    fn redact_strings(&self, kind: &EventKind, original: Value) -> EventKind {
        let mut edits = Vec::new();
        if let Some(payload) = original.get("payload") {
            self.collect_string_edits(payload, "/payload".to_string(), false, &mut edits);
        }

        let mut value = original;
        let mut latest = kind.clone();
        let mut skipped = 0;
        for (pointer, replacement) in edits {
            let Some(Value::String(slot)) = value.pointer_mut(&pointer) else {
                continue;
            };
            let previous = std::mem::replace(slot, replacement);
            match serde_json::from_value::<EventKind>(value.clone()) {
                Ok(parsed) => latest = parsed,
                Err(_) => {
                    skipped += 1;
                    if let Some(Value::String(slot)) = value.pointer_mut(&pointer) {
                        *slot = previous;
                    }
                }
            }
        }
        debug!(skipped, "Redactor::redact_strings: done");
        latest
    }

    fn collect_string_edits(&self, value: &Value, pointer: String, sensitive: bool, edits: &mut Vec<(String, String)>) {
        match value {
            Value::String(s) => {
                let redacted = if sensitive { REDACTED.to_string() } else { self.redact_str(s) };
                if redacted != *s {
                    edits.push((pointer, redacted));
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.collect_string_edits(item, format!("{}/{}", pointer, i), sensitive, edits);
                }
            }
            Value::Object(map) => {
                for (key, v) in map {
                    let escaped = key.replace('~', "~0").replace('/', "~1");
                    let nested = sensitive || self.is_sensitive_key(key);
                    self.collect_string_edits(v, format!("{}/{}", pointer, escaped), nested, edits);
                }
            }
            _ => {}
        }
    }
}

/// Which part of an over-long string is cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncateStrategy {
    /// Cut the beginning, keep the end
    Head,
    /// Cut the end, keep the beginning
    Tail,
    /// Keep both ends, cut the middle
    #[default]
    Middle,
}

impl fmt::Display for TruncateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TruncateStrategy::Head => write!(f, "head"),
            TruncateStrategy::Tail => write!(f, "tail"),
            TruncateStrategy::Middle => write!(f, "middle"),
        }
    }
}

impl FromStr for TruncateStrategy {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" => Ok(TruncateStrategy::Head),
            "tail" => Ok(TruncateStrategy::Tail),
            "middle" => Ok(TruncateStrategy::Middle),
            other => Err(RunError::Validation(format!("Unknown truncation strategy: {}", other))),
        }
    }
}

fn marker(dropped: usize) -> String {
    format!("[TRUNCATED {} chars]", dropped)
}

/// Cap `input` at `max_chars` characters, splicing in a `[TRUNCATED n chars]` marker
///
/// Counts Unicode scalar values, so multi-byte text is never split mid-character.
/// The marker itself is not counted against `max_chars`.
pub fn truncate_str(input: &str, max_chars: usize, strategy: TruncateStrategy) -> Cow<'_, str> {
    let total = input.chars().count();
    if total <= max_chars {
        return Cow::Borrowed(input);
    }
    let dropped = total - max_chars;
    let byte_at = |chars: usize| input.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(input.len());

    let out = match strategy {
        TruncateStrategy::Tail => format!("{}{}", &input[..byte_at(max_chars)], marker(dropped)),
        TruncateStrategy::Head => format!("{}{}", marker(dropped), &input[byte_at(dropped)..]),
        TruncateStrategy::Middle => {
            let keep_head = max_chars.div_ceil(2);
            let keep_tail = max_chars - keep_head;
            format!(
                "{}{}{}",
                &input[..byte_at(keep_head)],
                marker(dropped),
                &input[byte_at(total - keep_tail)..]
            )
        }
    };
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        CommitPayload, Completed, DiffPayload, ErrorPayload, EventKind, FileChangeSummary, FileDiffHunk, FileStatus,
        RunId, RunStarted, UsagePayload,
    };
    use serde_json::json;

    const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn test_redacts_common_secrets() {
        let input = "Use sk-ABCDEF1234567890ABCDE and Authorization: Bearer foo.bar.baz and OPENAI_API_KEY=xyz";
        let out = Redactor::shared().redact_str(input);

        assert!(!out.contains("sk-ABCDEF"));
        assert!(out.contains("sk-***REDACTED***"));
        assert!(out.contains("Authorization: Bearer ***REDACTED***"));
        assert!(out.contains("OPENAI_API_KEY=***REDACTED***"));
        assert!(!out.contains("foo.bar.baz"));
    }

    #[test]
    fn test_api_key_query_param() {
        let out = Redactor::shared().redact_str("GET /v1?api_key=abcdef0123456789&x=1");
        assert_eq!(out, "GET /v1?api_key=***REDACTED***&x=1");
    }

    #[test]
    fn test_leaves_plain_text() {
        let text = "nothing to see here, sk-short";
        assert_eq!(Redactor::shared().redact_str(text), text);
    }

    #[test]
    fn test_extra_patterns() {
        let config = RedactionConfig {
            extra_patterns: vec![PatternRule {
                pattern: "(?i)supersecret".to_string(),
                replacement: default_replacement(),
            }],
            ..Default::default()
        };
        let redactor = Redactor::new(&config).unwrap();
        assert_eq!(
            redactor.redact_str("this contains SuperSecret value"),
            "this contains ***REDACTED*** value"
        );
    }

    #[test]
    fn test_invalid_extra_pattern_is_validation_error() {
        let config = RedactionConfig {
            extra_patterns: vec![PatternRule {
                pattern: "(unclosed".to_string(),
                replacement: default_replacement(),
            }],
            ..Default::default()
        };
        let err = Redactor::new(&config).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
    }

    #[test]
    fn test_redacts_sensitive_keys_recursively() {
        let mut value = json!({
            "apiKey": "abcd",
            "nested": { "password": "pw", "deep": { "Token": "tok" } },
            "list": [{ "secret": 42 }],
            "keep": "value"
        });
        Redactor::shared().redact_value(&mut value);

        assert_eq!(value["apiKey"], REDACTED);
        assert_eq!(value["nested"]["password"], REDACTED);
        assert_eq!(value["nested"]["deep"]["Token"], REDACTED);
        assert_eq!(value["list"][0]["secret"], REDACTED);
        assert_eq!(value["keep"], "value");
    }

    #[test]
    fn test_redact_event_keeps_variant() {
        let event = RunEvent::new(
            RunId::from("r1"),
            EventKind::Error(ErrorPayload {
                message: "401 for key sk-ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
                data: Some(json!({ "authorization": "Bearer abc" })),
                ..Default::default()
            }),
        );
        let redacted = Redactor::shared().redact_event(&event);

        assert_eq!(redacted.run_id(), event.run_id());
        assert_eq!(redacted.time(), event.time());
        match redacted.kind() {
            EventKind::Error(e) => {
                assert_eq!(e.message, "401 for key sk-***REDACTED***");
                assert_eq!(e.data.as_ref().unwrap()["authorization"], REDACTED);
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_typed_sensitive_key_still_masks_other_strings() {
        let config = RedactionConfig {
            extra_keys: vec!["usage".to_string(), "success".to_string()],
            ..Default::default()
        };
        let redactor = Redactor::new(&config).unwrap();
        let event = RunEvent::new(
            RunId::from("r1"),
            EventKind::Completed(Completed {
                success: true,
                usage: Some(UsagePayload {
                    requests: 2,
                    total_tokens: 40,
                    ..Default::default()
                }),
                message: Some("done with sk-ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string()),
            }),
        );

        match redactor.redact_event(&event).kind() {
            EventKind::Completed(c) => {
                assert_eq!(c.message.as_deref(), Some("done with sk-***REDACTED***"));
                assert!(c.success);
                assert_eq!(c.usage.as_ref().unwrap().total_tokens, 40);
            }
            other => panic!("Expected completed, got {:?}", other),
        }
    }

    #[test]
    fn test_enum_under_sensitive_key_is_skipped_not_leaked() {
        let config = RedactionConfig {
            extra_keys: vec!["status".to_string()],
            ..Default::default()
        };
        let redactor = Redactor::new(&config).unwrap();
        let event = RunEvent::new(
            RunId::from("r1"),
            EventKind::Diff(DiffPayload {
                proposal_id: "p1".to_string(),
                files: vec![FileDiffHunk {
                    file_path: "config.env".to_string(),
                    old_path: None,
                    status: FileStatus::Modified,
                    unified_diff: "+OPENAI_API_KEY=abc123secret".to_string(),
                }],
                summary: FileChangeSummary::default(),
            }),
        );

        let redacted = redactor.redact_event(&event);
        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("abc123secret"));
        match redacted.kind() {
            EventKind::Diff(d) => {
                assert_eq!(d.files[0].status, FileStatus::Modified);
                assert_eq!(d.files[0].unified_diff, "+OPENAI_API_KEY=***REDACTED***");
            }
            other => panic!("Expected diff, got {:?}", other),
        }
    }

    #[test]
    fn test_sensitive_key_in_meta() {
        let event = RunEvent::new(
            RunId::from("r1"),
            EventKind::RunStarted(RunStarted {
                project_id: "p".to_string(),
                meta: Some(json!({ "token": "t0k3n", "labels": { "team": "core" } })),
                ..Default::default()
            }),
        );
        let json = serde_json::to_string(&Redactor::shared().redact_event(&event)).unwrap();
        assert!(!json.contains("t0k3n"));
        assert!(json.contains("core"));
    }

    #[test]
    fn test_disabled_redactor_passes_through() {
        let redactor = Redactor::disabled();
        let event = RunEvent::new(
            RunId::from("r1"),
            EventKind::Commit(CommitPayload {
                proposal_id: "p".to_string(),
                commit_sha: "abc".to_string(),
                message: "sk-ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
            }),
        );
        assert_eq!(redactor.redact_event(&event), event);
        assert!(!redactor.is_enabled());
    }

    #[test]
    fn test_truncate_tail() {
        let out = truncate_str(ALPHABET, 10, TruncateStrategy::Tail);
        assert!(out.starts_with("abcdefghij"));
        assert_eq!(&out[10..], "[TRUNCATED 16 chars]");
    }

    #[test]
    fn test_truncate_head() {
        let out = truncate_str(ALPHABET, 10, TruncateStrategy::Head);
        assert_eq!(out, "[TRUNCATED 16 chars]qrstuvwxyz");
    }

    #[test]
    fn test_truncate_middle() {
        let out = truncate_str(ALPHABET, 10, TruncateStrategy::Middle);
        assert!(out.starts_with("abc"));
        assert!(out.ends_with("xyz"));
        assert_eq!(out, "abcde[TRUNCATED 16 chars]vwxyz");
    }

    #[test]
    fn test_truncate_short_input_borrows() {
        assert!(matches!(truncate_str("short", 10, TruncateStrategy::Middle), Cow::Borrowed("short")));
    }

    #[test]
    fn test_truncate_multibyte() {
        let out = truncate_str("ééééé", 2, TruncateStrategy::Tail);
        assert_eq!(out, "éé[TRUNCATED 3 chars]");
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("TAIL".parse::<TruncateStrategy>().unwrap(), TruncateStrategy::Tail);
        assert!("sideways".parse::<TruncateStrategy>().is_err());
        assert_eq!(TruncateStrategy::default().to_string(), "middle");
    }
}
