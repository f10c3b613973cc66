//! Streaming event protocol.
//!
//! When invoked with `--output-format stream-json`, provider CLIs emit
//! newline-delimited JSON events. This module deserializes the raw
//! provider-specific events and lowers them into the neutral
//! [`ProviderEvent`] sum the agent runtime consumes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Provider-neutral streaming events.
///
/// A tagged sum, not a bag of optional fields: every consumer matches on
/// the variant it cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Assistant text fragment.
    Text { text: String },

    /// Reasoning fragment.
    Thinking { text: String },

    /// Tool invocation by the assistant.
    ToolCall {
        tool_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    /// Result of a tool invocation.
    ToolResult {
        tool_id: String,
        content: String,
        is_error: bool,
    },

    /// Terminal event with session stats.
    Result {
        success: bool,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        error: Option<String>,
    },
}

/// Raw events emitted by Claude-style CLIs in `stream-json` mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawStreamEvent {
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: RawAssistantMessage,
    },
    User {
        message: RawUserMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<RawUsage>,
        #[serde(default)]
        result: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RawAssistantMessage {
    content: Vec<RawContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawUserMessage {
    content: Vec<RawUserContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawUserContentBlock {
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// Maximum number of log lines emitted per unknown event type.
const UNKNOWN_EVENT_LOG_CAP: u32 = 5;

/// Parses NDJSON lines from a provider's stream output into neutral events.
///
/// Unknown event types are counted per type (logged at most
/// [`UNKNOWN_EVENT_LOG_CAP`] times each) and otherwise ignored. Malformed
/// JSON lines are skipped with a debug log.
#[derive(Debug, Default)]
pub struct StreamParser {
    unknown_counts: HashMap<String, u32>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one line of stdout into zero or more neutral events.
    pub fn parse_line(&mut self, line: &str) -> Vec<ProviderEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(
                    error = %e,
                    line = truncate(trimmed, 100),
                    "Skipping malformed stream line"
                );
                return Vec::new();
            }
        };

        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        match serde_json::from_value::<RawStreamEvent>(value) {
            Ok(raw) => Self::lower(raw),
            Err(_) => {
                self.record_unknown(&event_type);
                Vec::new()
            }
        }
    }

    /// Counts seen per unknown event type. Test hook.
    pub fn unknown_counts(&self) -> &HashMap<String, u32> {
        &self.unknown_counts
    }

    fn record_unknown(&mut self, event_type: &str) {
        let key = if event_type.is_empty() {
            "<untyped>"
        } else {
            event_type
        };
        let count = self.unknown_counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count <= UNKNOWN_EVENT_LOG_CAP {
            warn!(
                event_type = key,
                occurrences = *count,
                "Ignoring unknown stream event type"
            );
        }
    }

    fn lower(raw: RawStreamEvent) -> Vec<ProviderEvent> {
        match raw {
            RawStreamEvent::System { session_id, model } => {
                debug!(?session_id, ?model, "Provider session started");
                Vec::new()
            }
            RawStreamEvent::Assistant { message } => message
                .content
                .into_iter()
                .map(|block| match block {
                    RawContentBlock::Text { text } => ProviderEvent::Text { text },
                    RawContentBlock::Thinking { thinking } => {
                        ProviderEvent::Thinking { text: thinking }
                    }
                    RawContentBlock::ToolUse { id, name, input } => ProviderEvent::ToolCall {
                        tool_id: id,
                        tool_name: name,
                        input,
                    },
                })
                .collect(),
            RawStreamEvent::User { message } => message
                .content
                .into_iter()
                .map(|block| match block {
                    RawUserContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => ProviderEvent::ToolResult {
                        tool_id: tool_use_id,
                        content: flatten_tool_content(&content),
                        is_error,
                    },
                })
                .collect(),
            RawStreamEvent::Result {
                is_error,
                usage,
                result,
            } => {
                let (input_tokens, output_tokens) = usage
                    .map(|u| (Some(u.input_tokens), Some(u.output_tokens)))
                    .unwrap_or((None, None));
                vec![ProviderEvent::Result {
                    success: !is_error,
                    input_tokens,
                    output_tokens,
                    error: if is_error { result } else { None },
                }]
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Tool result content may be a plain string or a content-block array.
fn flatten_tool_content(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_len)
            .map(|(idx, _)| idx)
            .unwrap_or(s.len());
        format!("{}...", &s[..byte_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_text() {
        let mut parser = StreamParser::new();
        let events = parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::Text {
                text: "Hello".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_thinking() {
        let mut parser = StreamParser::new();
        let events = parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::Thinking {
                text: "hmm".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_tool_call() {
        let mut parser = StreamParser::new();
        let events = parser.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"bash","input":{"command":"ls"}}]}}"#,
        );
        match &events[0] {
            ProviderEvent::ToolCall {
                tool_id,
                tool_name,
                input,
            } => {
                assert_eq!(tool_id, "t1");
                assert_eq!(tool_name, "bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tool_result_string_content() {
        let mut parser = StreamParser::new();
        let events = parser.parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"file.txt"}]}}"#,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::ToolResult {
                tool_id: "t1".to_string(),
                content: "file.txt".to_string(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn test_parse_tool_result_block_content() {
        let mut parser = StreamParser::new();
        let events = parser.parse_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"is_error":true}]}}"#,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::ToolResult {
                tool_id: "t1".to_string(),
                content: "a\nb".to_string(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn test_parse_result_success() {
        let mut parser = StreamParser::new();
        let events = parser.parse_line(
            r#"{"type":"result","is_error":false,"usage":{"input_tokens":100,"output_tokens":20}}"#,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::Result {
                success: true,
                input_tokens: Some(100),
                output_tokens: Some(20),
                error: None,
            }]
        );
    }

    #[test]
    fn test_parse_result_error_carries_message() {
        let mut parser = StreamParser::new();
        let events =
            parser.parse_line(r#"{"type":"result","is_error":true,"result":"context overflow"}"#);
        assert_eq!(
            events,
            vec![ProviderEvent::Result {
                success: false,
                input_tokens: None,
                output_tokens: None,
                error: Some("context overflow".to_string()),
            }]
        );
    }

    #[test]
    fn test_system_event_produces_nothing() {
        let mut parser = StreamParser::new();
        let events =
            parser.parse_line(r#"{"type":"system","session_id":"abc","model":"claude-opus"}"#);
        assert!(events.is_empty());
        assert!(parser.unknown_counts().is_empty());
    }

    #[test]
    fn test_unknown_event_counted_per_type() {
        let mut parser = StreamParser::new();
        for _ in 0..8 {
            parser.parse_line(r#"{"type":"stream_event","delta":{}}"#);
        }
        parser.parse_line(r#"{"type":"other_thing"}"#);

        assert_eq!(parser.unknown_counts().get("stream_event"), Some(&8));
        assert_eq!(parser.unknown_counts().get("other_thing"), Some(&1));
    }

    #[test]
    fn test_malformed_and_empty_lines_skipped() {
        let mut parser = StreamParser::new();
        assert!(parser.parse_line("").is_empty());
        assert!(parser.parse_line("   ").is_empty());
        assert!(parser.parse_line("{not json}").is_empty());
        assert!(parser.parse_line("plain text").is_empty());
        // Malformed lines are not unknown *events*.
        assert!(parser.unknown_counts().is_empty());
    }
}
