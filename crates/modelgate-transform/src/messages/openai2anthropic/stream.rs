use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::json;

use modelgate_protocol::anthropic::messages::{
    ContentBlock, ContentDelta, CreateMessageResponse, MessageDeltaBody, StreamEvent, Usage,
};
use modelgate_protocol::openai::chat::{ChatCompletionChunk, Usage as OpenAiUsage};

use super::response::{map_stop_reason, synthesize_message_id, transform_usage};

/// Translates one OpenAI chat-completions SSE stream into Anthropic Messages events.
///
/// Strictly single-writer: one instance per stream, fed chunks in arrival order.
/// `usage` on any chunk replaces the running totals (providers may emit usage on
/// every delta; only the last is authoritative). The `[DONE]` sentinel and upstream
/// EOF are equivalent terminators: both drive [`finish`](Self::finish), which closes
/// every open block and emits `message_delta` + `message_stop` exactly once.
#[derive(Debug)]
pub struct OpenAiToAnthropicStreamState {
    message_id: Option<String>,
    model: String,
    usage: Usage,
    started: bool,
    text_block_open: bool,
    current_content_index: usize,
    started_tools: BTreeMap<u32, usize>,
    finish_reason: Option<String>,
    finished: bool,
}

impl OpenAiToAnthropicStreamState {
    pub fn new() -> Self {
        Self {
            message_id: None,
            model: String::new(),
            usage: Usage::default(),
            started: false,
            text_block_open: false,
            current_content_index: 0,
            started_tools: BTreeMap::new(),
            finish_reason: None,
            finished: false,
        }
    }

    pub fn transform_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        if let Some(usage) = chunk.usage {
            self.replace_usage(usage);
        }

        if !self.started {
            self.started = true;
            self.message_id = Some(
                chunk
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(synthesize_message_id),
            );
            self.model = chunk.model.clone().unwrap_or_default();
            out.push(self.message_start_event());
        }

        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }

            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    if !self.text_block_open {
                        self.text_block_open = true;
                        out.push(StreamEvent::ContentBlockStart {
                            index: self.current_content_index,
                            content_block: ContentBlock::text(""),
                        });
                    }
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.current_content_index,
                        delta: ContentDelta::TextDelta { text },
                    });
                }
            }

            for call in choice.delta.tool_calls.unwrap_or_default() {
                let name = call.function.as_ref().and_then(|f| f.name.clone());
                if let (Some(id), Some(name)) = (call.id, name) {
                    if self.text_block_open {
                        self.text_block_open = false;
                        out.push(StreamEvent::ContentBlockStop {
                            index: self.current_content_index,
                        });
                    }
                    let index = self.current_content_index + 1 + call.index as usize;
                    self.started_tools.insert(call.index, index);
                    out.push(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::ToolUse {
                            id,
                            name,
                            input: json!({}),
                        },
                    });
                }
                if let Some(arguments) = call.function.and_then(|f| f.arguments) {
                    if !arguments.is_empty() {
                        if let Some(index) = self.started_tools.get(&call.index) {
                            out.push(StreamEvent::ContentBlockDelta {
                                index: *index,
                                delta: ContentDelta::InputJsonDelta {
                                    partial_json: arguments,
                                },
                            });
                        }
                    }
                }
            }
        }

        out
    }

    /// Emit the closing sequence. Safe to call on both `[DONE]` and EOF; only the
    /// first call produces events.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            self.message_id = Some(synthesize_message_id());
            out.push(self.message_start_event());
        }
        if self.text_block_open {
            self.text_block_open = false;
            out.push(StreamEvent::ContentBlockStop {
                index: self.current_content_index,
            });
        }
        for index in self.started_tools.values() {
            out.push(StreamEvent::ContentBlockStop { index: *index });
        }
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(map_stop_reason(self.finish_reason.as_deref()).to_string()),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        out.push(StreamEvent::MessageStop);
        out
    }

    fn replace_usage(&mut self, usage: OpenAiUsage) {
        self.usage = transform_usage(usage);
    }

    fn message_start_event(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: CreateMessageResponse {
                id: self.message_id.clone().unwrap_or_default(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.usage.input_tokens,
                    output_tokens: 0,
                    ..Usage::default()
                },
            },
        }
    }
}

impl Default for OpenAiToAnthropicStreamState {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames one event as `event: <name>\ndata: <json>\n\n`.
pub fn encode_event(event: &StreamEvent) -> Bytes {
    let payload = serde_json::to_vec(event).unwrap_or_default();
    let name = event.name();
    let mut out = Vec::with_capacity(payload.len() + name.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(&payload);
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_protocol::openai::chat::{
        ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallDelta,
    };

    fn text_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: Some("chatcmpl-9".to_string()),
            model: Some("llama-3".to_string()),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(text.to_string()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn finish_chunk(reason: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(reason.to_string()),
            }],
            ..Default::default()
        }
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[test]
    fn text_stream_event_sequence() {
        let mut state = OpenAiToAnthropicStreamState::new();
        let mut events = Vec::new();
        events.extend(state.transform_chunk(text_chunk("He")));
        events.extend(state.transform_chunk(text_chunk("llo")));
        events.extend(state.transform_chunk(finish_chunk("stop")));
        events.extend(state.finish());

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert!(matches!(
            &events[1],
            StreamEvent::ContentBlockStart { index: 0, content_block: ContentBlock::Text { text } }
                if text.is_empty()
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text } }
                if text == "He"
        ));
        assert!(matches!(
            &events[5],
            StreamEvent::MessageDelta { delta, .. }
                if delta.stop_reason.as_deref() == Some("end_turn")
        ));
    }

    #[test]
    fn tool_call_stream_closes_text_and_opens_tool_block() {
        let mut state = OpenAiToAnthropicStreamState::new();
        let mut events = Vec::new();
        events.extend(state.transform_chunk(text_chunk("Let me check")));
        events.extend(state.transform_chunk(ChatCompletionChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: 0,
                        id: Some("c1".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some("get_weather".to_string()),
                            arguments: Some("{\"ci".to_string()),
                        }),
                    }]),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            ..Default::default()
        }));
        events.extend(state.transform_chunk(ChatCompletionChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: 0,
                        id: None,
                        function: Some(FunctionCallDelta {
                            name: None,
                            arguments: Some("ty\":\"NYC\"}".to_string()),
                        }),
                    }]),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            ..Default::default()
        }));
        events.extend(state.transform_chunk(finish_chunk("tool_calls")));
        events.extend(state.finish());

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Tool block lands at current_content_index + 1 + tool index.
        assert!(matches!(
            &events[4],
            StreamEvent::ContentBlockStart { index: 1, content_block: ContentBlock::ToolUse { id, name, .. } }
                if id == "c1" && name == "get_weather"
        ));
        let json_deltas: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(json_deltas.concat(), "{\"city\":\"NYC\"}");
        assert!(matches!(
            &events[8],
            StreamEvent::MessageDelta { delta, .. }
                if delta.stop_reason.as_deref() == Some("tool_use")
        ));
    }

    #[test]
    fn eof_without_done_still_closes_stream() {
        let mut state = OpenAiToAnthropicStreamState::new();
        let mut events = Vec::new();
        events.extend(state.transform_chunk(text_chunk("partial")));
        events.extend(state.finish());

        let names = names(&events);
        assert!(names.contains(&"content_block_stop"));
        assert_eq!(names[names.len() - 2], "message_delta");
        assert_eq!(names[names.len() - 1], "message_stop");

        // A second terminator (e.g. [DONE] after EOF handling) is a no-op.
        assert!(state.finish().is_empty());
    }

    #[test]
    fn usage_is_last_wins() {
        let mut state = OpenAiToAnthropicStreamState::new();
        let mut chunk = text_chunk("a");
        chunk.usage = Some(OpenAiUsage {
            prompt_tokens: Some(1),
            completion_tokens: Some(1),
            ..Default::default()
        });
        state.transform_chunk(chunk);

        let mut last = finish_chunk("stop");
        last.usage = Some(OpenAiUsage {
            prompt_tokens: Some(9),
            completion_tokens: Some(4),
            ..Default::default()
        });
        state.transform_chunk(last);

        let events = state.finish();
        let usage = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::MessageDelta { usage, .. } => Some(usage),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.output_tokens, 4);
    }

    #[test]
    fn reassembled_text_matches_openai_deltas() {
        let deltas = ["The ", "quick ", "brown ", "fox"];
        let mut state = OpenAiToAnthropicStreamState::new();
        let mut text = String::new();
        for delta in deltas {
            for event in state.transform_chunk(text_chunk(delta)) {
                if let StreamEvent::ContentBlockDelta {
                    delta: ContentDelta::TextDelta { text: piece },
                    ..
                } = event
                {
                    text.push_str(&piece);
                }
            }
        }
        state.finish();
        assert_eq!(text, deltas.concat());
    }

    #[test]
    fn encode_event_frames_sse() {
        let framed = encode_event(&StreamEvent::MessageStop);
        let framed = std::str::from_utf8(&framed).unwrap();
        assert_eq!(framed, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }
}
