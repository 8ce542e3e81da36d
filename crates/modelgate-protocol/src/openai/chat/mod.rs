pub mod request;
pub mod response;
pub mod stream;

pub use request::{
    ChatMessage, ContentPart, CreateChatCompletionRequest, FileSource, FunctionCall,
    FunctionDefinition, ImageUrl, MessageContent, Tool, ToolCall, ToolChoice, ToolChoiceFunction,
};
pub use response::{
    ChatChoice, CreateChatCompletionResponse, ErrorBody, ErrorDetail, PromptTokensDetails,
    ResponseMessage, Usage,
};
pub use stream::{ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallDelta};
