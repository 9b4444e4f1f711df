// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stream-json wire protocol.
//!
//! One JSON object per line in both directions. Outbound objects are user
//! turns and permission responses; inbound objects are classified into
//! [`AgentMessage`] kinds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::warn;

use crate::error::AgentError;

/// A content block inside an assistant (or echoed user) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }
}

/// An inbound protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// First message of a process; carries the resume token.
    Init { session_id: String },
    /// Any other system message.
    System { subtype: Option<String> },
    Assistant { content: Vec<ContentBlock> },
    /// Tool results echoed back as a user turn.
    User { content: Vec<ContentBlock> },
    PermissionRequest {
        id: String,
        tool_name: String,
        tool_input: Value,
    },
    /// Terminal message of a turn.
    Result {
        cost_usd: f64,
        duration_ms: u64,
        is_error: bool,
        text: Option<String>,
    },
    /// A well-formed object of a kind this daemon does not act on.
    Other { kind: String },
}

impl AgentMessage {
    /// Short kind name used in logs.
    pub fn kind(&self) -> &str {
        match self {
            Self::Init { .. } => "init",
            Self::System { .. } => "system",
            Self::Assistant { .. } => "assistant",
            Self::User { .. } => "user",
            Self::PermissionRequest { .. } => "permission_request",
            Self::Result { .. } => "result",
            Self::Other { kind } => kind,
        }
    }

    /// Classify a parsed JSON object.
    pub fn from_value(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let subtype = value.get("subtype").and_then(Value::as_str).map(str::to_string);
        let session_id = value.get("session_id").and_then(Value::as_str).map(str::to_string);

        match kind.as_str() {
            "init" => match session_id {
                Some(session_id) => Self::Init { session_id },
                None => Self::System { subtype: Some("init".to_string()) },
            },
            "system" => match (subtype.as_deref(), session_id) {
                (Some("init"), Some(session_id)) | (None, Some(session_id)) => {
                    Self::Init { session_id }
                }
                _ => Self::System { subtype },
            },
            "assistant" => Self::Assistant {
                content: content_blocks(&value),
            },
            "user" => Self::User {
                content: content_blocks(&value),
            },
            "permission_request" => Self::PermissionRequest {
                id: string_field(&value, "id")
                    .or_else(|| string_field(&value, "request_id"))
                    .unwrap_or_default(),
                tool_name: string_field(&value, "tool_name").unwrap_or_default(),
                tool_input: value.get("tool_input").cloned().unwrap_or(Value::Null),
            },
            "result" => Self::Result {
                cost_usd: value
                    .get("total_cost_usd")
                    .or_else(|| value.get("cost_usd"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                duration_ms: value.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
                is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                text: string_field(&value, "result"),
            },
            _ => Self::Other { kind },
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Content blocks at `message.content`; a bare string becomes one text block.
fn content_blocks(value: &Value) -> Vec<ContentBlock> {
    match value.pointer("/message/content") {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .map(|b| serde_json::from_value(b.clone()).unwrap_or(ContentBlock::Unknown))
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse one protocol line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<AgentMessage>, AgentError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line).map_err(|e| {
        let preview: String = line.chars().take(200).collect();
        AgentError::Communication(format!("malformed protocol line ({}): {}", e, preview))
    })?;
    if !value.is_object() {
        return Err(AgentError::Communication(format!(
            "protocol line is not an object: {}",
            line.chars().take(200).collect::<String>()
        )));
    }
    Ok(Some(AgentMessage::from_value(value)))
}

/// Encode a user turn.
pub fn encode_user_message(text: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": text}],
        },
    })
    .to_string()
}

/// Encode a permission decision.
pub fn encode_permission_response(request_id: &str, allowed: bool) -> String {
    json!({
        "type": "permission_response",
        "id": request_id,
        "allowed": allowed,
    })
    .to_string()
}

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// Lazy sequence of parsed messages from one process's output.
///
/// Created once per process start; ends when the output closes.
pub struct ResponseStream {
    lines: LineReader,
    raw_log: Option<std::fs::File>,
    finished: bool,
}

impl ResponseStream {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
            raw_log: None,
            finished: false,
        }
    }

    /// Append every raw line read to `path`.
    pub fn with_raw_log(mut self, path: &Path) -> Self {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => self.raw_log = Some(file),
            Err(e) => warn!("Cannot open raw agent log {:?}: {}", path, e),
        }
        self
    }

    /// Next message, `None` once the stream has ended.
    ///
    /// A read failure or malformed line yields one `Err` and ends the stream.
    pub async fn next(&mut self) -> Option<Result<AgentMessage, AgentError>> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(AgentError::Communication(e.to_string())));
                }
            };

            if let Some(file) = self.raw_log.as_mut() {
                use std::io::Write;
                let _ = writeln!(file, "{}", line);
            }

            match parse_line(&line) {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_encode_user_message() {
        insta::assert_snapshot!(
            encode_user_message("add X"),
            @r#"{"message":{"content":[{"text":"add X","type":"text"}],"role":"user"},"type":"user"}"#
        );
    }

    #[test]
    fn test_encode_permission_response() {
        insta::assert_snapshot!(
            encode_permission_response("req-1", true),
            @r#"{"allowed":true,"id":"req-1","type":"permission_response"}"#
        );
    }

    #[test]
    fn test_parse_init() {
        let msg = parse_line(r#"{"type":"system","subtype":"init","session_id":"abc"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg, AgentMessage::Init { session_id: "abc".into() });

        let msg = parse_line(r#"{"type":"init","session_id":"xyz"}"#).unwrap().unwrap();
        assert_eq!(msg, AgentMessage::Init { session_id: "xyz".into() });
    }

    #[test]
    fn test_parse_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"hi"},
            {"type":"tool_use","id":"tu1","name":"Bash","input":{"command":"ls"}},
            {"type":"mystery"}]}}"#
            .replace('\n', "");
        let msg = parse_line(&line).unwrap().unwrap();
        match msg {
            AgentMessage::Assistant { content } => {
                assert_eq!(content.len(), 3);
                assert!(content[0].is_text());
                assert!(content[1].is_tool_use());
                assert_eq!(content[2], ContentBlock::Unknown);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_result() {
        let msg = parse_line(r#"{"type":"result","total_cost_usd":0.05,"duration_ms":12300,"result":"done"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            AgentMessage::Result {
                cost_usd: 0.05,
                duration_ms: 12300,
                is_error: false,
                text: Some("done".into()),
            }
        );
    }

    #[test]
    fn test_parse_permission_request() {
        let msg = parse_line(r#"{"type":"permission_request","id":"p1","tool_name":"Write","tool_input":{"path":"a"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "permission_request");
    }

    #[test]
    fn test_parse_blank_and_malformed() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("not json").unwrap_err().is_communication());
        assert!(parse_line("[1,2]").is_err());
    }

    #[tokio::test]
    async fn test_response_stream_ends_on_close() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut stream = ResponseStream::new(rx);

        tx.write_all(b"{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s1\"}\n\n")
            .await
            .unwrap();
        tx.write_all(b"{\"type\":\"result\",\"total_cost_usd\":0.1,\"duration_ms\":5}\n")
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(stream.next().await, Some(Ok(AgentMessage::Init { .. }))));
        assert!(matches!(stream.next().await, Some(Ok(AgentMessage::Result { .. }))));
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_response_stream_malformed_line_ends_stream() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut stream = ResponseStream::new(rx);
        tx.write_all(b"garbage\n{\"type\":\"result\"}\n").await.unwrap();

        assert!(matches!(stream.next().await, Some(Err(AgentError::Communication(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_response_stream_raw_log() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("agent.raw.log");
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut stream = ResponseStream::new(rx).with_raw_log(&log);

        tx.write_all(b"{\"type\":\"system\",\"subtype\":\"status\"}\n").await.unwrap();
        drop(tx);
        while stream.next().await.is_some() {}

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("\"subtype\":\"status\""));
    }
}
