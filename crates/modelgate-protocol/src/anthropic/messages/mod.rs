pub mod request;
pub mod response;
pub mod stream;
pub mod types;

pub use request::{
    CreateMessageRequest, MessageParam, MessageParamContent, Metadata, SystemPrompt,
    ToolChoiceParam, ToolParam,
};
pub use response::{CreateMessageResponse, ErrorDetail, ErrorResponse, Usage};
pub use stream::{ContentDelta, MessageDeltaBody, StreamEvent};
pub use types::{ContentBlock, DocumentSource, ImageSource, ToolResultContent};
