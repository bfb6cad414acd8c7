pub mod capture;
pub mod proxy;
pub mod sinks;
pub mod tail;

pub use capture::{CapturePipeline, PipelineStats};
pub use proxy::ProxyInstance;
pub use sinks::{build_sinks, DispatchHandle, Sink, SinkDispatcher, SinkSet};
