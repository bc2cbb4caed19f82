use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::ParseError;

/// Session that collects records whose line carried no session id. The angle brackets keep
/// it apart from real session ids, which are UUIDs.
pub const UNASSIGNED_SESSION_ID: &str = "<unassigned>";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_tokens)
            .saturating_add(self.cache_read_tokens)
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// One typed block of message content, resolved once at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Image {
        #[serde(default)]
        source: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    User,
    Assistant,
    Summary,
    System,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    User {
        content: Vec<ContentBlock>,
    },
    Assistant {
        model: Option<String>,
        request_id: Option<String>,
        content: Vec<ContentBlock>,
        usage: TokenUsage,
    },
    Summary {
        text: String,
        leaf_uuid: Option<String>,
    },
    System {
        text: String,
        level: Option<String>,
    },
    Other {
        raw_type: String,
    },
}

/// One parsed transcript line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub line: usize,
    pub session_id: Option<String>,
    pub uuid: Option<String>,
    pub parent_uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub is_sidechain: bool,
    pub body: RecordBody,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self.body {
            RecordBody::User { .. } => RecordKind::User,
            RecordBody::Assistant { .. } => RecordKind::Assistant,
            RecordBody::Summary { .. } => RecordKind::Summary,
            RecordBody::System { .. } => RecordKind::System,
            RecordBody::Other { .. } => RecordKind::Other,
        }
    }

    /// Session this record is partitioned into.
    pub fn session_key(&self) -> &str {
        self.session_id.as_deref().unwrap_or(UNASSIGNED_SESSION_ID)
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        match &self.body {
            RecordBody::Assistant { usage, .. } => Some(usage),
            _ => None,
        }
    }

    /// Plain text of the record. Thinking and tool blocks are skipped.
    pub fn text(&self) -> String {
        match &self.body {
            RecordBody::User { content } | RecordBody::Assistant { content, .. } => content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            RecordBody::Summary { text, .. } | RecordBody::System { text, .. } => text.clone(),
            RecordBody::Other { .. } => String::new(),
        }
    }
}

/// Records of one source file plus the problems met while reading it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileParse {
    pub records: Vec<Record>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: RawContent,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for RawContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

impl RawContent {
    fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentBlock::Text { text }],
            Self::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

impl From<RawUsage> for TokenUsage {
    fn from(raw: RawUsage) -> Self {
        Self {
            input_tokens: raw.input_tokens.unwrap_or(0),
            output_tokens: raw.output_tokens.unwrap_or(0),
            cache_creation_tokens: raw.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: raw.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

/// Parse one transcript line. `line` is the 1-based line number within its file.
pub fn parse_line(text: &str, line: usize) -> Result<Record, ParseError> {
    let parsed: Value = serde_json::from_str(text).map_err(ParseError::MalformedJson)?;
    if !parsed.is_object() {
        return Err(ParseError::unrecognized("line is not a JSON object"));
    }
    let Some(raw_type) = str_at(&parsed, &["type"]) else {
        return Err(ParseError::unrecognized("missing string `type` field"));
    };

    let timestamp = match str_at(&parsed, &["timestamp"]) {
        Some(text) => Some(
            parse_utc_timestamp(&text)
                .ok_or_else(|| ParseError::unrecognized(format!("bad timestamp {text:?}")))?,
        ),
        None => None,
    };

    let body = match raw_type.as_str() {
        "user" => {
            require_timestamp(timestamp, "user")?;
            let message = message_at(&parsed)?;
            RecordBody::User {
                content: message.content.into_blocks(),
            }
        }
        "assistant" => {
            require_timestamp(timestamp, "assistant")?;
            let message = message_at(&parsed)?;
            RecordBody::Assistant {
                model: message.model,
                request_id: str_at(&parsed, &["requestId"]),
                content: message.content.into_blocks(),
                usage: message.usage.map(TokenUsage::from).unwrap_or_default(),
            }
        }
        "summary" => {
            let Some(text) = str_at(&parsed, &["summary"]) else {
                return Err(ParseError::unrecognized("summary without text"));
            };
            RecordBody::Summary {
                text,
                leaf_uuid: str_at(&parsed, &["leafUuid"]),
            }
        }
        "system" => RecordBody::System {
            text: str_at(&parsed, &["content"]).unwrap_or_default(),
            level: str_at(&parsed, &["level"]),
        },
        _ => RecordBody::Other { raw_type },
    };

    Ok(Record {
        line,
        session_id: str_at(&parsed, &["sessionId"]),
        uuid: str_at(&parsed, &["uuid"]),
        parent_uuid: str_at(&parsed, &["parentUuid"]),
        timestamp,
        cwd: str_at(&parsed, &["cwd"]),
        is_sidechain: parsed
            .get("isSidechain")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        body,
    })
}

pub fn load_file(path: &Path) -> io::Result<FileParse> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    load_reader(&mut reader, path)
}

/// Read every line from `reader`. Bad lines are skipped and counted, never fatal.
pub fn load_reader<R: BufRead>(reader: &mut R, source: &Path) -> io::Result<FileParse> {
    let mut parse = FileParse::default();
    let mut buffer = Vec::new();
    let mut line_no = 0usize;
    loop {
        buffer.clear();
        let bytes = reader.read_until(b'\n', &mut buffer)?;
        if bytes == 0 {
            break;
        }
        line_no += 1;
        let text = match std::str::from_utf8(&buffer) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %source.display(), line = line_no, error = %err, "skipping transcript line with invalid UTF-8");
                parse.diagnostics.record(DiagnosticKind::MalformedJson);
                continue;
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_line(trimmed, line_no) {
            Ok(record) => {
                if let RecordBody::Other { raw_type } = &record.body {
                    debug!(path = %source.display(), line = line_no, kind = %raw_type, "keeping unknown record kind");
                    parse.diagnostics.record(DiagnosticKind::SchemaDrift);
                }
                if record.session_id.is_none() && record.kind() != RecordKind::Summary {
                    parse.diagnostics.record(DiagnosticKind::MissingSessionId);
                }
                parse.records.push(record);
            }
            Err(err) => {
                warn!(path = %source.display(), line = line_no, error = %err, "skipping transcript line");
                parse.diagnostics.record(DiagnosticKind::from(&err));
            }
        }
    }
    Ok(parse)
}

fn message_at(parsed: &Value) -> Result<RawMessage, ParseError> {
    let Some(message) = parsed.get("message") else {
        return Err(ParseError::unrecognized("missing `message` object"));
    };
    RawMessage::deserialize(message)
        .map_err(|err| ParseError::unrecognized(format!("invalid message: {err}")))
}

fn require_timestamp(timestamp: Option<DateTime<Utc>>, kind: &str) -> Result<(), ParseError> {
    if timestamp.is_none() {
        return Err(ParseError::unrecognized(format!("{kind} record without timestamp")));
    }
    Ok(())
}

pub(crate) fn parse_utc_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current
        .as_str()
        .map(ToString::to_string)
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = r#"{"type":"user","sessionId":"s1","uuid":"u1","parentUuid":null,"timestamp":"2025-06-01T10:00:00Z","cwd":"/work/app","isSidechain":false,"message":{"role":"user","content":"Fix the parser"}}"#;
    const ASSISTANT: &str = r#"{"type":"assistant","sessionId":"s1","uuid":"a1","parentUuid":"u1","timestamp":"2025-06-01T10:00:05Z","requestId":"req_1","message":{"id":"msg_1","role":"assistant","model":"claude-sonnet-4","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Done."},{"type":"tool_use","id":"t1","name":"Edit","input":{"file_path":"src/lib.rs"}}],"usage":{"input_tokens":10,"output_tokens":20,"cache_creation_input_tokens":3,"cache_read_input_tokens":null}}}"#;

    #[test]
    fn parses_user_string_content() {
        let record = parse_line(USER, 1).expect("user record");
        assert_eq!(record.kind(), RecordKind::User);
        assert_eq!(record.session_key(), "s1");
        assert_eq!(record.uuid.as_deref(), Some("u1"));
        assert_eq!(record.parent_uuid, None);
        assert_eq!(record.cwd.as_deref(), Some("/work/app"));
        assert_eq!(record.text(), "Fix the parser");
        assert!(record.usage().is_none());
    }

    #[test]
    fn parses_assistant_blocks_and_usage() {
        let record = parse_line(ASSISTANT, 2).expect("assistant record");
        let RecordBody::Assistant {
            model,
            request_id,
            content,
            usage,
        } = &record.body
        else {
            panic!("expected assistant body");
        };
        assert_eq!(model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(request_id.as_deref(), Some("req_1"));
        assert_eq!(content.len(), 3);
        assert!(matches!(content[2], ContentBlock::ToolUse { ref name, .. } if name == "Edit"));
        assert_eq!(
            *usage,
            TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                cache_creation_tokens: 3,
                cache_read_tokens: 0,
            }
        );
        assert_eq!(record.text(), "Done.");
    }

    #[test]
    fn unknown_content_block_is_kept_as_unknown() {
        let line = r#"{"type":"user","sessionId":"s1","timestamp":"2025-06-01T10:00:00Z","message":{"role":"user","content":[{"type":"document","data":"x"},{"type":"text","text":"hi"}]}}"#;
        let record = parse_line(line, 1).expect("record");
        let RecordBody::User { content } = &record.body else {
            panic!("expected user body");
        };
        assert_eq!(content[0], ContentBlock::Unknown);
        assert_eq!(record.text(), "hi");
    }

    #[test]
    fn summary_keeps_leaf_reference() {
        let line = r#"{"type":"summary","summary":"Parser refactor","leafUuid":"a1"}"#;
        let record = parse_line(line, 3).expect("summary");
        assert_eq!(record.kind(), RecordKind::Summary);
        assert_eq!(
            record.body,
            RecordBody::Summary {
                text: "Parser refactor".to_string(),
                leaf_uuid: Some("a1".to_string()),
            }
        );
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn unknown_kind_becomes_other() {
        let line = r#"{"type":"file-history-snapshot","sessionId":"s1","timestamp":"2025-06-01T10:00:00Z","snapshot":{}}"#;
        let record = parse_line(line, 1).expect("other record");
        assert_eq!(record.kind(), RecordKind::Other);
        assert_eq!(
            record.body,
            RecordBody::Other {
                raw_type: "file-history-snapshot".to_string()
            }
        );
    }

    #[test]
    fn classifies_parse_failures() {
        assert!(matches!(
            parse_line("{not json", 1),
            Err(ParseError::MalformedJson(_))
        ));
        assert!(matches!(
            parse_line("[1,2,3]", 1),
            Err(ParseError::UnrecognizedSchema(_))
        ));
        assert!(matches!(
            parse_line(r#"{"sessionId":"s1"}"#, 1),
            Err(ParseError::UnrecognizedSchema(_))
        ));
        assert!(matches!(
            parse_line(r#"{"type":"user","sessionId":"s1","message":{"content":"x"}}"#, 1),
            Err(ParseError::UnrecognizedSchema(_))
        ));
        assert!(matches!(
            parse_line(
                r#"{"type":"assistant","sessionId":"s1","timestamp":"2025-06-01T10:00:00Z","message":{"content":[],"usage":{"input_tokens":-4}}}"#,
                1
            ),
            Err(ParseError::UnrecognizedSchema(_))
        ));
        assert!(matches!(
            parse_line(r#"{"type":"system","timestamp":"yesterday-ish"}"#, 1),
            Err(ParseError::UnrecognizedSchema(_))
        ));
    }

    #[test]
    fn load_reader_skips_bad_lines_and_counts_them() {
        let content = format!(
            "{USER}\n\n{{broken\n{}\n{ASSISTANT}\n{}\n",
            r#"{"type":"progress","timestamp":"2025-06-01T10:00:01Z"}"#,
            r#"{"type":"summary"}"#
        );
        let mut reader = io::Cursor::new(content.into_bytes());
        let parse = load_reader(&mut reader, Path::new("mem.jsonl")).expect("load");

        assert_eq!(parse.records.len(), 3);
        assert_eq!(
            parse.records.iter().map(|r| r.line).collect::<Vec<_>>(),
            vec![1, 4, 5]
        );
        assert_eq!(parse.records[1].session_key(), UNASSIGNED_SESSION_ID);
        assert_eq!(parse.diagnostics.count(DiagnosticKind::MalformedJson), 1);
        assert_eq!(parse.diagnostics.count(DiagnosticKind::UnrecognizedSchema), 1);
        assert_eq!(parse.diagnostics.count(DiagnosticKind::SchemaDrift), 1);
        assert_eq!(parse.diagnostics.count(DiagnosticKind::MissingSessionId), 1);
    }

    #[test]
    fn load_reader_skips_invalid_utf8_lines() {
        let mut content = Vec::new();
        content.extend_from_slice(
            br#"{"type":"user","sessionId":"s1","timestamp":"2025-06-01T10:00:00Z","message":{"content":"ab"#,
        );
        content.extend_from_slice(&[0xff, 0xfe]);
        content.extend_from_slice(b"cd\"}}\n");
        content.extend_from_slice(USER.as_bytes());
        content.push(b'\n');
        let mut reader = io::Cursor::new(content);
        let parse = load_reader(&mut reader, Path::new("mem.jsonl")).expect("load");

        assert_eq!(parse.records.len(), 1);
        assert_eq!(parse.records[0].line, 2);
        assert_eq!(parse.diagnostics.count(DiagnosticKind::MalformedJson), 1);
    }

    #[test]
    fn literal_unassigned_session_id_stays_separate() {
        let record = parse_line(
            r#"{"type":"system","sessionId":"unassigned","timestamp":"2025-06-01T10:00:00Z"}"#,
            1,
        )
        .expect("record");
        assert_eq!(record.session_key(), "unassigned");
        assert_ne!(record.session_key(), UNASSIGNED_SESSION_ID);
    }

    #[test]
    fn record_serde_roundtrip_is_lossless() {
        let record = parse_line(ASSISTANT, 7).expect("record");
        let json = serde_json::to_string(&record).expect("serialize");
        let back: Record = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn usage_add_saturates() {
        let mut total = TokenUsage {
            input_tokens: u64::MAX - 1,
            ..TokenUsage::default()
        };
        total.add(&TokenUsage {
            input_tokens: 5,
            output_tokens: 2,
            ..TokenUsage::default()
        });
        assert_eq!(total.input_tokens, u64::MAX);
        assert_eq!(total.output_tokens, 2);
    }
}
