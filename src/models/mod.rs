pub mod config;
pub mod message;
pub mod record;
pub mod sse;
pub mod usage;

pub use config::CaptureConfig;
pub use message::{ContentBlock, Message, MessageContent, RequestEnvelope, Role};
pub use record::{
    FlowRequest, FlowResponse, PendingRequest, RequestSnapshot, ResponseMeta, TrafficRecord,
};
pub use sse::SseEvent;
pub use usage::UsageStats;
