pub mod request;
pub mod streaming;

pub use request::{openai_response_to_claude, transform_claude_to_openai};
pub use streaming::{delta_to_events, finish_events, message_start_event, sse_frame, OpenAiStreamState};
