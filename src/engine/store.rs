use anyhow::{Context, Result, anyhow};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// One conversation message after ingest normalization. Timestamps are
/// normalized to Unix epoch seconds regardless of the export's own format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub timestamp: i64,
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub attachment_refs: Vec<String>,
}

fn parse_timestamp(value: &Value, line_no: usize) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| anyhow!("line {line_no}: timestamp is not a whole number")),
        Value::String(s) => {
            let parsed = DateTime::parse_from_rfc3339(s.trim())
                .map_err(|err| anyhow!("line {line_no}: bad RFC 3339 timestamp `{s}`: {err}"))?;
            Ok(parsed.timestamp())
        }
        other => Err(anyhow!(
            "line {line_no}: timestamp must be epoch seconds or RFC 3339, got {other}"
        )),
    }
}

fn parse_message(line: &str, line_no: usize) -> Result<Message> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| anyhow!("line {line_no}: invalid JSON: {err}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("line {line_no}: message must be a JSON object"))?;

    let required_str = |key: &str| -> Result<String> {
        let field = obj
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if field.is_empty() {
            return Err(anyhow!("line {line_no}: missing or empty `{key}`"));
        }
        Ok(field.to_string())
    };

    let timestamp_value = obj
        .get("timestamp")
        .ok_or_else(|| anyhow!("line {line_no}: missing `timestamp`"))?;

    let attachment_refs = match obj.get("attachment_refs") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| anyhow!("line {line_no}: attachment refs must be strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => {
            return Err(anyhow!("line {line_no}: `attachment_refs` must be an array"));
        }
    };

    Ok(Message {
        id: required_str("id")?,
        thread_id: required_str("thread_id")?,
        timestamp: parse_timestamp(timestamp_value, line_no)?,
        author: required_str("author")?,
        // Text may legitimately be empty (attachment-only messages).
        text: obj
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        attachment_refs,
    })
}

/// Load a JSONL message export and return it ordered by `(timestamp, id)`.
///
/// A malformed line fails the whole load: a window built over a silently
/// dropped message would commit a fingerprint that can never be reproduced.
pub fn load_messages(path: &Path) -> Result<Vec<Message>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message = parse_message(trimmed, idx + 1)
            .with_context(|| format!("failed to parse message export {}", path.display()))?;
        out.push(message);
    }

    out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    Ok(out)
}

/// Approximate UTF-8 payload size of one message as seen by the generator.
pub fn message_bytes(message: &Message) -> u64 {
    (message.author.len() + message.text.len() + 2) as u64
}

#[cfg(test)]
mod tests {
    use super::{load_messages, message_bytes, parse_message};
    use std::fs;
    use tempfile::tempdir;

    fn line(id: &str, ts: &str, author: &str, text: &str) -> String {
        format!(
            r#"{{"id":"{id}","thread_id":"t1","timestamp":{ts},"author":"{author}","text":"{text}"}}"#
        )
    }

    #[test]
    fn parses_epoch_and_rfc3339_timestamps() {
        let from_epoch = parse_message(&line("m1", "1700000000", "alice", "hi"), 1).expect("epoch");
        assert_eq!(from_epoch.timestamp, 1_700_000_000);

        let from_rfc = parse_message(
            &line("m2", "\"2023-11-14T22:13:20Z\"", "bob", "yo"),
            2,
        )
        .expect("rfc3339");
        assert_eq!(from_rfc.timestamp, 1_700_000_000);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let err = parse_message(r#"{"id":"m1","timestamp":1}"#, 3).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn load_sorts_by_timestamp_then_id() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("export.jsonl");
        let body = [
            line("m3", "30", "a", "last"),
            line("m2", "10", "a", "tie-b"),
            line("m1", "10", "a", "tie-a"),
        ]
        .join("\n");
        fs::write(&path, body).expect("write export");

        let messages = load_messages(&path).expect("load");
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }

    #[test]
    fn load_fails_on_malformed_line() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("export.jsonl");
        fs::write(&path, format!("{}\nnot json\n", line("m1", "1", "a", "x")))
            .expect("write export");
        assert!(load_messages(&path).is_err());
    }

    #[test]
    fn message_bytes_counts_author_and_text() {
        let msg = parse_message(&line("m1", "1", "ab", "cdef"), 1).expect("parse");
        assert_eq!(message_bytes(&msg), 8);
    }
}
