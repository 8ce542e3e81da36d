use serde_json::json;

use modelgate_protocol::anthropic::messages::{
    ContentBlock, CreateMessageRequest, DocumentSource, ImageSource, MessageParamContent,
    SystemPrompt, ToolChoiceParam, ToolParam, ToolResultContent,
};
use modelgate_protocol::openai::chat::{
    ChatMessage, ContentPart, CreateChatCompletionRequest, FileSource, FunctionCall,
    FunctionDefinition, ImageUrl, MessageContent, Tool, ToolCall, ToolChoice, ToolChoiceFunction,
};

pub fn transform_request(request: CreateMessageRequest) -> CreateChatCompletionRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = request.system {
        messages.push(ChatMessage::text("system", system_text(system)));
    }

    for message in request.messages {
        match message.content {
            MessageParamContent::Text(text) => {
                messages.push(ChatMessage::text(message.role, text));
            }
            MessageParamContent::Blocks(blocks) => {
                transform_blocks(&message.role, blocks, &mut messages);
            }
        }
    }

    CreateChatCompletionRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens,
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        user: request.metadata.and_then(|metadata| metadata.user_id),
        tools: request
            .tools
            .map(|tools| tools.into_iter().map(transform_tool).collect()),
        tool_choice: request.tool_choice.map(transform_tool_choice),
    }
}

fn system_text(system: SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text,
        SystemPrompt::Blocks(blocks) => {
            let texts: Vec<String> = blocks
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text),
                    _ => None,
                })
                .collect();
            texts.join("\n")
        }
    }
}

/// Walks one Anthropic message's block list. `tool_result` blocks become separate
/// `role: "tool"` messages appended after the main message; unknown block types are
/// dropped.
fn transform_blocks(role: &str, blocks: Vec<ContentBlock>, messages: &mut Vec<ChatMessage>) {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_messages = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text }),
            ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_url(source),
                },
            }),
            ContentBlock::Document { source } => parts.push(ContentPart::File {
                file: file_source(source),
            }),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => tool_messages.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(MessageContent::Text(tool_result_text(content))),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            }),
            ContentBlock::Unknown => {}
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        let content = if parts.is_empty() {
            Some(MessageContent::Text(String::new()))
        } else if parts.len() == 1 && matches!(parts[0], ContentPart::Text { .. }) {
            match parts.pop() {
                Some(ContentPart::Text { text }) => Some(MessageContent::Text(text)),
                _ => None,
            }
        } else {
            Some(MessageContent::Parts(parts))
        };
        messages.push(ChatMessage {
            role: role.to_string(),
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        });
    }

    messages.extend(tool_messages);
}

fn image_url(source: ImageSource) -> String {
    match source {
        ImageSource::Url { url } => url,
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
    }
}

fn file_source(source: DocumentSource) -> FileSource {
    match source {
        DocumentSource::Url { url } => FileSource {
            file_url: Some(url),
            file_data: None,
            mime_type: None,
        },
        DocumentSource::Base64 { media_type, data } => FileSource {
            file_url: None,
            file_data: Some(data),
            mime_type: Some(media_type),
        },
    }
}

fn tool_result_text(content: Option<ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text,
        Some(ToolResultContent::Blocks(blocks)) => {
            let all_text = blocks
                .iter()
                .all(|block| matches!(block, ContentBlock::Text { .. }));
            if all_text {
                let texts: Vec<String> = blocks
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect();
                texts.join("\n")
            } else {
                serde_json::to_string(&blocks).unwrap_or_default()
            }
        }
    }
}

fn transform_tool(tool: ToolParam) -> Tool {
    match tool.input_schema {
        Some(schema) => Tool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: tool.name.unwrap_or_default(),
                description: tool.description,
                parameters: schema,
            },
        },
        // Server built-ins expose no schema; surface them as plain functions.
        None => Tool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: tool.name.or(tool.kind).unwrap_or_default(),
                description: tool.description,
                parameters: json!({}),
            },
        },
    }
}

fn transform_tool_choice(choice: ToolChoiceParam) -> ToolChoice {
    match choice {
        ToolChoiceParam::Auto => ToolChoice::Mode("auto".to_string()),
        ToolChoiceParam::Any => ToolChoice::Mode("required".to_string()),
        ToolChoiceParam::None => ToolChoice::Mode("none".to_string()),
        ToolChoiceParam::Tool { name } => ToolChoice::Tool {
            kind: "function".to_string(),
            function: ToolChoiceFunction { name },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_protocol::anthropic::messages::MessageParam;

    fn base_request(messages: Vec<MessageParam>) -> CreateMessageRequest {
        CreateMessageRequest {
            model: "openrouter/llama".to_string(),
            max_tokens: 64,
            messages,
            system: None,
            tools: None,
            tool_choice: None,
            stop_sequences: None,
            metadata: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
        }
    }

    fn user_blocks(blocks: Vec<ContentBlock>) -> MessageParam {
        MessageParam {
            role: "user".to_string(),
            content: MessageParamContent::Blocks(blocks),
        }
    }

    #[test]
    fn system_string_becomes_leading_message() {
        let mut request = base_request(vec![MessageParam {
            role: "user".to_string(),
            content: MessageParamContent::Text("hi".to_string()),
        }]);
        request.system = Some(SystemPrompt::Text("be terse".to_string()));

        let out = transform_request(request);
        assert_eq!(out.messages[0].role, "system");
        assert!(matches!(
            out.messages[0].content,
            Some(MessageContent::Text(ref text)) if text == "be terse"
        ));
        assert_eq!(out.messages[1].role, "user");
    }

    #[test]
    fn system_blocks_are_joined() {
        let mut request = base_request(vec![]);
        request.system = Some(SystemPrompt::Blocks(vec![
            ContentBlock::text("a"),
            ContentBlock::text("b"),
        ]));

        let out = transform_request(request);
        assert!(matches!(
            out.messages[0].content,
            Some(MessageContent::Text(ref text)) if text == "a\nb"
        ));
    }

    #[test]
    fn single_text_block_simplifies_to_string() {
        let request = base_request(vec![user_blocks(vec![ContentBlock::text("hello")])]);
        let out = transform_request(request);
        assert!(matches!(
            out.messages[0].content,
            Some(MessageContent::Text(ref text)) if text == "hello"
        ));
    }

    #[test]
    fn base64_image_becomes_data_url() {
        let request = base_request(vec![user_blocks(vec![
            ContentBlock::text("look"),
            ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
            },
        ])]);
        let out = transform_request(request);
        let Some(MessageContent::Parts(parts)) = &out.messages[0].content else {
            panic!("expected parts");
        };
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,AAAA"
        ));
    }

    #[test]
    fn tool_use_becomes_tool_call_with_empty_content() {
        let request = base_request(vec![MessageParam {
            role: "assistant".to_string(),
            content: MessageParamContent::Blocks(vec![ContentBlock::ToolUse {
                id: "c1".to_string(),
                name: "get_weather".to_string(),
                input: json!({"city": "NYC"}),
            }]),
        }]);
        let out = transform_request(request);
        let message = &out.messages[0];
        assert!(matches!(
            message.content,
            Some(MessageContent::Text(ref text)) if text.is_empty()
        ));
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            json!({"city": "NYC"})
        );
    }

    #[test]
    fn tool_result_splits_into_tool_message() {
        let request = base_request(vec![user_blocks(vec![
            ContentBlock::ToolResult {
                tool_use_id: "c1".to_string(),
                content: Some(ToolResultContent::Text("sunny".to_string())),
                is_error: None,
            },
            ContentBlock::text("thanks"),
        ])]);
        let out = transform_request(request);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, "user");
        assert_eq!(out.messages[1].role, "tool");
        assert_eq!(out.messages[1].tool_call_id.as_deref(), Some("c1"));
        assert!(matches!(
            out.messages[1].content,
            Some(MessageContent::Text(ref text)) if text == "sunny"
        ));
    }

    #[test]
    fn unknown_blocks_are_dropped() {
        let request = base_request(vec![user_blocks(vec![
            ContentBlock::Unknown,
            ContentBlock::text("kept"),
        ])]);
        let out = transform_request(request);
        assert!(matches!(
            out.messages[0].content,
            Some(MessageContent::Text(ref text)) if text == "kept"
        ));
    }

    #[test]
    fn builtin_tool_gets_name_from_type_and_empty_schema() {
        let mut request = base_request(vec![]);
        request.tools = Some(vec![ToolParam {
            name: None,
            kind: Some("web_search".to_string()),
            description: None,
            input_schema: None,
        }]);
        let out = transform_request(request);
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].function.name, "web_search");
        assert_eq!(tools[0].function.parameters, json!({}));
    }

    #[test]
    fn tool_choice_mapping() {
        for (choice, expected) in [
            (ToolChoiceParam::Auto, "auto"),
            (ToolChoiceParam::Any, "required"),
        ] {
            let mut request = base_request(vec![]);
            request.tool_choice = Some(choice);
            let out = transform_request(request);
            assert!(matches!(
                out.tool_choice,
                Some(ToolChoice::Mode(ref mode)) if mode == expected
            ));
        }

        let mut request = base_request(vec![]);
        request.tool_choice = Some(ToolChoiceParam::Tool {
            name: "lookup".to_string(),
        });
        let out = transform_request(request);
        assert!(matches!(
            out.tool_choice,
            Some(ToolChoice::Tool { ref kind, ref function })
                if kind == "function" && function.name == "lookup"
        ));
    }

    #[test]
    fn stop_sequences_and_metadata_map() {
        let mut request = base_request(vec![]);
        request.stop_sequences = Some(vec!["END".to_string()]);
        request.metadata = Some(modelgate_protocol::anthropic::messages::Metadata {
            user_id: Some("acct-9".to_string()),
        });
        let out = transform_request(request);
        assert_eq!(out.stop.unwrap(), vec!["END".to_string()]);
        assert_eq!(out.user.as_deref(), Some("acct-9"));
        assert_eq!(out.max_tokens, 64);
    }
}
