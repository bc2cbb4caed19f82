use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::{Record, RecordBody, RecordKind};
use crate::session::Session;

/// Where a message id lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRef {
    pub session_id: String,
    pub from_assistant: bool,
}

/// A summary line waiting to be resolved against the project's messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryEntry {
    pub text: String,
    pub leaf_uuid: Option<String>,
    pub source: PathBuf,
    pub line: usize,
}

impl SummaryEntry {
    pub fn from_record(record: &Record, source: &Path) -> Option<Self> {
        match &record.body {
            RecordBody::Summary { text, leaf_uuid } => Some(Self {
                text: text.clone(),
                leaf_uuid: leaf_uuid.clone(),
                source: source.to_path_buf(),
                line: record.line,
            }),
            _ => None,
        }
    }
}

/// A summary whose leaf reference matched no known message. Kept, never dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanSummary {
    pub text: String,
    pub leaf_uuid: Option<String>,
    pub source: PathBuf,
    pub line: usize,
}

impl From<SummaryEntry> for OrphanSummary {
    fn from(entry: SummaryEntry) -> Self {
        Self {
            text: entry.text,
            leaf_uuid: entry.leaf_uuid,
            source: entry.source,
            line: entry.line,
        }
    }
}

/// Message id to session id over every file of a project.
#[derive(Debug, Clone, Default)]
pub struct MessageIndex {
    entries: HashMap<String, MessageRef>,
}

impl MessageIndex {
    /// Assistant mappings replace user mappings; otherwise the first mapping stays.
    pub fn insert(&mut self, uuid: &str, reference: MessageRef) {
        match self.entries.get(uuid) {
            Some(existing) if existing.from_assistant || !reference.from_assistant => {}
            _ => {
                self.entries.insert(uuid.to_string(), reference);
            }
        }
    }

    pub fn extend<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a String, &'a MessageRef)>,
    {
        for (uuid, reference) in entries {
            self.insert(uuid, reference.clone());
        }
    }

    pub fn resolve(&self, uuid: &str) -> Option<&MessageRef> {
        self.entries.get(uuid)
    }
}

/// Message ids of one file's records.
pub fn message_refs(records: &[Record]) -> BTreeMap<String, MessageRef> {
    let mut index = MessageIndex::default();
    for record in records {
        if record.kind() == RecordKind::Summary {
            continue;
        }
        if let Some(uuid) = &record.uuid {
            index.insert(
                uuid,
                MessageRef {
                    session_id: record.session_key().to_string(),
                    from_assistant: record.kind() == RecordKind::Assistant,
                },
            );
        }
    }
    index.entries.into_iter().collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryMatches {
    pub titles: BTreeMap<String, String>,
    pub orphans: Vec<OrphanSummary>,
}

impl SummaryMatches {
    pub fn apply(&self, sessions: &mut BTreeMap<String, Session>) {
        for (session_id, title) in &self.titles {
            if let Some(session) = sessions.get_mut(session_id) {
                session.summary = Some(title.clone());
            }
        }
    }
}

/// Resolve every summary once the index is complete. Later summaries win among equals,
/// and a summary reached through an assistant message beats one reached through a user message.
pub fn match_summaries(index: &MessageIndex, mut summaries: Vec<SummaryEntry>) -> SummaryMatches {
    summaries.sort_by(|a, b| (&a.source, a.line).cmp(&(&b.source, b.line)));

    let mut chosen: BTreeMap<String, (bool, String)> = BTreeMap::new();
    let mut orphans = Vec::new();
    for summary in summaries {
        let target = summary
            .leaf_uuid
            .as_deref()
            .and_then(|leaf| index.resolve(leaf));
        let Some(target) = target else {
            debug!(source = %summary.source.display(), line = summary.line, "summary has no matching message");
            orphans.push(OrphanSummary::from(summary));
            continue;
        };

        match chosen.get(&target.session_id) {
            Some((from_assistant, _)) if *from_assistant && !target.from_assistant => {}
            _ => {
                chosen.insert(
                    target.session_id.clone(),
                    (target.from_assistant, summary.text),
                );
            }
        }
    }

    SummaryMatches {
        titles: chosen
            .into_iter()
            .map(|(session_id, (_, text))| (session_id, text))
            .collect(),
        orphans,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_line;
    use crate::session::{DEFAULT_FIRST_MESSAGE_CHARS, assemble_sessions};

    fn line(json: &str, n: usize) -> Record {
        parse_line(json, n).expect("record")
    }

    fn summary(text: &str, leaf: &str, source: &str, n: usize) -> SummaryEntry {
        SummaryEntry {
            text: text.to_string(),
            leaf_uuid: Some(leaf.to_string()),
            source: PathBuf::from(source),
            line: n,
        }
    }

    #[test]
    fn summary_titles_its_session_and_orphan_is_kept() {
        let records = vec![
            line(
                r#"{"type":"user","sessionId":"S1","uuid":"U0","timestamp":"2025-06-01T10:00:00Z","message":{"role":"user","content":"first question"}}"#,
                1,
            ),
            line(
                r#"{"type":"assistant","sessionId":"S1","uuid":"M1","timestamp":"2025-06-01T10:00:10Z","message":{"role":"assistant","content":[{"type":"text","text":"answer"}]}}"#,
                2,
            ),
            line(r#"{"type":"summary","summary":"Parser fixes","leafUuid":"M1"}"#, 3),
            line(r#"{"type":"summary","summary":"Lost thread","leafUuid":"NOPE"}"#, 4),
        ];
        let source = Path::new("/p/one.jsonl");
        let mut index = MessageIndex::default();
        index.extend(&message_refs(&records));
        let summaries = records
            .iter()
            .filter_map(|record| SummaryEntry::from_record(record, source))
            .collect();

        let matches = match_summaries(&index, summaries);
        let mut sessions = assemble_sessions(records, Some(source), DEFAULT_FIRST_MESSAGE_CHARS);
        matches.apply(&mut sessions);

        let s1 = &sessions["S1"];
        assert_eq!(s1.summary.as_deref(), Some("Parser fixes"));
        assert_eq!(s1.display_title(), "Parser fixes");
        assert_eq!(s1.record_count(), 2);
        assert_eq!(s1.first_timestamp, s1.records[0].timestamp);
        assert_eq!(s1.last_timestamp, s1.records[1].timestamp);
        assert_eq!(matches.orphans.len(), 1);
        assert_eq!(matches.orphans[0].text, "Lost thread");
        assert_eq!(matches.orphans[0].line, 4);
    }

    #[test]
    fn resolves_across_files() {
        let records = vec![line(
            r#"{"type":"assistant","sessionId":"S2","uuid":"M9","timestamp":"2025-06-01T10:00:10Z","message":{"content":[]}}"#,
            1,
        )];
        let mut index = MessageIndex::default();
        index.extend(&message_refs(&records));
        let matches = match_summaries(&index, vec![summary("Elsewhere", "M9", "/p/other.jsonl", 1)]);
        assert_eq!(matches.titles.get("S2").map(String::as_str), Some("Elsewhere"));
        assert!(matches.orphans.is_empty());
    }

    #[test]
    fn assistant_mapping_beats_user_mapping() {
        let mut index = MessageIndex::default();
        index.insert(
            "dup",
            MessageRef {
                session_id: "from-user".to_string(),
                from_assistant: false,
            },
        );
        index.insert(
            "dup",
            MessageRef {
                session_id: "from-assistant".to_string(),
                from_assistant: true,
            },
        );
        index.insert(
            "dup",
            MessageRef {
                session_id: "late-user".to_string(),
                from_assistant: false,
            },
        );
        assert_eq!(
            index.resolve("dup").map(|r| r.session_id.as_str()),
            Some("from-assistant")
        );
    }

    #[test]
    fn assistant_resolved_summary_wins_over_user_resolved() {
        let mut index = MessageIndex::default();
        index.insert(
            "A",
            MessageRef {
                session_id: "S".to_string(),
                from_assistant: true,
            },
        );
        index.insert(
            "U",
            MessageRef {
                session_id: "S".to_string(),
                from_assistant: false,
            },
        );
        let matches = match_summaries(
            &index,
            vec![
                summary("from assistant", "A", "/p/a.jsonl", 1),
                summary("from user", "U", "/p/b.jsonl", 1),
            ],
        );
        assert_eq!(matches.titles["S"], "from assistant");
    }

    #[test]
    fn later_summary_wins_among_equals() {
        let mut index = MessageIndex::default();
        for uuid in ["A1", "A2"] {
            index.insert(
                uuid,
                MessageRef {
                    session_id: "S".to_string(),
                    from_assistant: true,
                },
            );
        }
        let matches = match_summaries(
            &index,
            vec![
                summary("newer", "A2", "/p/a.jsonl", 9),
                summary("older", "A1", "/p/a.jsonl", 2),
            ],
        );
        assert_eq!(matches.titles["S"], "newer");
    }

    #[test]
    fn summary_without_leaf_is_orphaned() {
        let matches = match_summaries(
            &MessageIndex::default(),
            vec![SummaryEntry {
                text: "no leaf".to_string(),
                leaf_uuid: None,
                source: PathBuf::from("/p/a.jsonl"),
                line: 1,
            }],
        );
        assert_eq!(matches.orphans.len(), 1);
        assert!(matches.titles.is_empty());
    }
}
