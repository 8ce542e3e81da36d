use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use modelgate_protocol::anthropic::messages::{
    ContentBlock, CreateMessageResponse, ErrorDetail, ErrorResponse, Usage,
};
use modelgate_protocol::openai::chat::{
    CreateChatCompletionResponse, ErrorBody, ResponseMessage, Usage as OpenAiUsage,
};

pub fn transform_response(response: CreateChatCompletionResponse) -> CreateMessageResponse {
    let (message, finish_reason) = match response.choices.into_iter().next() {
        Some(choice) => (choice.message, choice.finish_reason),
        None => (ResponseMessage::default(), None),
    };

    let mut content = Vec::new();
    if let Some(text) = message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
    }
    if let Some(calls) = message.tool_calls {
        for call in calls {
            let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
    }
    if content.is_empty() {
        content.push(ContentBlock::text(""));
    }

    CreateMessageResponse {
        id: response
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(synthesize_message_id),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: response.model.unwrap_or_default(),
        stop_reason: Some(map_stop_reason(finish_reason.as_deref()).to_string()),
        stop_sequence: None,
        usage: transform_usage(response.usage.unwrap_or_default()),
    }
}

pub fn map_stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        _ => "end_turn",
    }
}

pub fn transform_usage(usage: OpenAiUsage) -> Usage {
    let cached = usage
        .cache_read_input_tokens
        .or_else(|| usage.prompt_tokens_details.and_then(|details| details.cached_tokens));
    Usage {
        input_tokens: usage.prompt_tokens.unwrap_or(0),
        output_tokens: usage.completion_tokens.unwrap_or(0),
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
        cache_read_input_tokens: cached,
    }
}

/// Rewraps a non-2xx upstream body into the Anthropic error shape, keeping whatever
/// detail fields the provider supplied.
pub fn transform_error(body: &[u8], provider: &str) -> ErrorResponse {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    ErrorResponse {
        error: ErrorDetail {
            message: parsed
                .error
                .message
                .unwrap_or_else(|| "Upstream provider error".to_string()),
            kind: parsed.error.kind.unwrap_or_else(|| "api_error".to_string()),
            param: parsed.error.param,
            code: parsed.error.code,
        },
        provider: Some(provider.to_string()),
    }
}

pub fn synthesize_message_id() -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default();
    format!("msg_{epoch_ms}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_protocol::openai::chat::{ChatChoice, FunctionCall, ToolCall};

    fn response_with(message: ResponseMessage, finish_reason: &str) -> CreateChatCompletionResponse {
        CreateChatCompletionResponse {
            id: Some("chatcmpl-1".to_string()),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason: Some(finish_reason.to_string()),
            }],
            model: Some("llama-3".to_string()),
            usage: Some(OpenAiUsage {
                prompt_tokens: Some(12),
                completion_tokens: Some(5),
                total_tokens: Some(17),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn text_response_maps_to_text_block() {
        let out = transform_response(response_with(
            ResponseMessage {
                role: Some("assistant".to_string()),
                content: Some("Hello".to_string()),
                tool_calls: None,
            },
            "stop",
        ));
        assert_eq!(out.id, "chatcmpl-1");
        assert_eq!(out.model, "llama-3");
        assert_eq!(out.stop_reason.as_deref(), Some("end_turn"));
        assert!(matches!(&out.content[0], ContentBlock::Text { text } if text == "Hello"));
        assert_eq!(out.usage.input_tokens, 12);
        assert_eq!(out.usage.output_tokens, 5);
    }

    #[test]
    fn tool_calls_map_to_tool_use_blocks() {
        let out = transform_response(response_with(
            ResponseMessage {
                role: Some("assistant".to_string()),
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "c1".to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: "get_weather".to_string(),
                        arguments: "{\"city\":\"NYC\"}".to_string(),
                    },
                }]),
            },
            "tool_calls",
        ));
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert!(matches!(
            &out.content[0],
            ContentBlock::ToolUse { id, name, input }
                if id == "c1" && name == "get_weather" && input == &json!({"city": "NYC"})
        ));
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let out = transform_response(response_with(
            ResponseMessage {
                role: None,
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "c2".to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: "noop".to_string(),
                        arguments: "{not json".to_string(),
                    },
                }]),
            },
            "tool_calls",
        ));
        assert!(matches!(
            &out.content[0],
            ContentBlock::ToolUse { input, .. } if input == &json!({})
        ));
    }

    #[test]
    fn empty_message_yields_single_empty_text_block() {
        let out = transform_response(response_with(ResponseMessage::default(), "stop"));
        assert_eq!(out.content.len(), 1);
        assert!(matches!(&out.content[0], ContentBlock::Text { text } if text.is_empty()));
    }

    #[test]
    fn stop_reason_table() {
        assert_eq!(map_stop_reason(Some("stop")), "end_turn");
        assert_eq!(map_stop_reason(Some("content_filter")), "end_turn");
        assert_eq!(map_stop_reason(Some("length")), "max_tokens");
        assert_eq!(map_stop_reason(Some("tool_calls")), "tool_use");
        assert_eq!(map_stop_reason(Some("function_call")), "tool_use");
        assert_eq!(map_stop_reason(Some("anything")), "end_turn");
        assert_eq!(map_stop_reason(None), "end_turn");
    }

    #[test]
    fn missing_id_is_synthesized() {
        let mut response = response_with(ResponseMessage::default(), "stop");
        response.id = None;
        let out = transform_response(response);
        assert!(out.id.starts_with("msg_"));
    }

    #[test]
    fn cached_tokens_pass_through() {
        let mut response = response_with(ResponseMessage::default(), "stop");
        response.usage = Some(OpenAiUsage {
            prompt_tokens: Some(100),
            completion_tokens: Some(1),
            prompt_tokens_details: Some(
                modelgate_protocol::openai::chat::PromptTokensDetails {
                    cached_tokens: Some(40),
                },
            ),
            ..Default::default()
        });
        let out = transform_response(response);
        assert_eq!(out.usage.cache_read_input_tokens, Some(40));
    }

    #[test]
    fn error_rewrap_keeps_fields_and_defaults() {
        let rewrapped = transform_error(
            br#"{"error":{"message":"bad model","type":"invalid_request_error","code":"model_not_found"}}"#,
            "openrouter",
        );
        assert_eq!(rewrapped.error.message, "bad model");
        assert_eq!(rewrapped.error.kind, "invalid_request_error");
        assert_eq!(rewrapped.error.code, Some(json!("model_not_found")));
        assert_eq!(rewrapped.provider.as_deref(), Some("openrouter"));

        let defaulted = transform_error(b"not json", "openrouter");
        assert_eq!(defaulted.error.message, "Upstream provider error");
        assert_eq!(defaulted.error.kind, "api_error");
    }
}
