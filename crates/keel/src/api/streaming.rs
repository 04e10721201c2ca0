//! Server-Sent Events (SSE) parsing for the chat completions API.
//!
//! [`SseDecoder`] turns raw response chunks into [`StreamEvent`]s as they
//! arrive off the wire, so text can be forwarded to the caller before the
//! turn is complete. [`assemble_completion`] rebuilds the full
//! [`ChatCompletion`] from the collected events once the stream ends.

use super::ChatCompletion;
use crate::{CallType, FunctionCallData, ToolCall, UsageInfo};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// A single event from an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// A tool call chunk (accumulated until complete).
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Token usage information (sent in the final chunk).
    Usage(UsageInfo),
    /// The choice finished, with the given reason.
    Finish(String),
    /// The stream is complete.
    Done,
}

/// Raw SSE data chunk.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Incremental line decoder for an SSE body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode every complete line in `chunk`, appending events to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<StreamEvent>) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while !self.done
            && let Some(newline_pos) = self.buffer.find('\n')
        {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            self.decode_line(line.trim(), out);
        }
    }

    /// Decode whatever is left in the buffer and make sure the events end
    /// with [`StreamEvent::Done`].
    pub fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        let remaining = std::mem::take(&mut self.buffer);
        if !self.done {
            self.decode_line(remaining.trim(), out);
        }
        if !self.done {
            self.done = true;
            out.push(StreamEvent::Done);
        }
    }

    fn decode_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        if line == "data: [DONE]" {
            self.done = true;
            out.push(StreamEvent::Done);
            return;
        }
        if let Some(data) = line.strip_prefix("data: ") {
            parse_sse_data(data, out);
        }
    }
}

/// Parse a single SSE `data:` payload into stream events.
pub fn parse_sse_data(data: &str, events: &mut Vec<StreamEvent>) {
    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e} (data: {data})");
            return;
        }
    };

    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(usage));
    }

    for choice in chunk.choices.into_iter().flatten() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                events.push(StreamEvent::TextDelta(content));
            }
            for tc in delta.tool_calls.into_iter().flatten() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                events.push(StreamEvent::ToolCallDelta {
                    index: tc.index.unwrap_or(0),
                    id: tc.id,
                    name,
                    arguments_delta: arguments,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            trace!("Stream finish_reason: {reason}");
            events.push(StreamEvent::Finish(reason));
        }
    }
}

/// Rebuild a full completion from stream events.
///
/// Tool call fragments are grouped by index; a call missing its id or name
/// is dropped.
pub fn assemble_completion(events: &[StreamEvent]) -> ChatCompletion {
    let mut text = String::new();
    let mut calls: BTreeMap<usize, (Option<String>, Option<String>, String)> = BTreeMap::new();
    let mut usage = None;
    let mut finish_reason = None;

    for event in events {
        match event {
            StreamEvent::TextDelta(delta) => text.push_str(delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                let entry = calls.entry(*index).or_insert((None, None, String::new()));
                if let Some(id) = id {
                    entry.0 = Some(id.clone());
                }
                if let Some(name) = name {
                    entry.1 = Some(name.clone());
                }
                entry.2.push_str(arguments_delta);
            }
            StreamEvent::Usage(u) => usage = Some(u.clone()),
            StreamEvent::Finish(reason) => finish_reason = Some(reason.clone()),
            StreamEvent::Done => {}
        }
    }

    let tool_calls = calls
        .into_values()
        .filter_map(|(id, name, arguments)| {
            Some(ToolCall {
                id: id?,
                call_type: CallType::Function,
                function: FunctionCallData {
                    name: name?,
                    arguments,
                },
            })
        })
        .collect();

    ChatCompletion {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
        usage,
        finish_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel", &mut events);
        assert!(events.is_empty());
        decoder.feed(b"lo\"}}]}\n\n: keep-alive\n", &mut events);
        assert_eq!(events, vec![StreamEvent::TextDelta("Hello".into())]);
    }

    #[test]
    fn stops_at_done_marker() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        decoder.feed(
            b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
            &mut events,
        );
        decoder.finish(&mut events);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn finish_appends_done_once() {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}", &mut events);
        decoder.finish(&mut events);
        assert_eq!(
            events,
            vec![StreamEvent::TextDelta("x".into()), StreamEvent::Done]
        );
    }

    #[test]
    fn assembles_text_tool_calls_and_usage() {
        let events = vec![
            StreamEvent::TextDelta("Checking ".into()),
            StreamEvent::TextDelta("files.".into()),
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("bash".into()),
                arguments_delta: "{\"command\":".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments_delta: "\"ls\"}".into(),
            },
            StreamEvent::ToolCallDelta {
                index: 1,
                id: None,
                name: Some("orphan".into()),
                arguments_delta: "{}".into(),
            },
            StreamEvent::Usage(UsageInfo {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                total_tokens: Some(15),
            }),
            StreamEvent::Finish("tool_calls".into()),
            StreamEvent::Done,
        ];
        let completion = assemble_completion(&events);
        assert_eq!(completion.content.as_deref(), Some("Checking files."));
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].function.arguments, r#"{"command":"ls"}"#);
        assert_eq!(completion.usage.unwrap().total_tokens, Some(15));
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    }
}
