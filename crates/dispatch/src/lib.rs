pub mod bridge;
pub mod handler;
pub mod retry;
pub mod sinks;

pub use bridge::{DispatchBridge, DispatchOutcome};
pub use handler::DispatchHandler;
pub use retry::RetryPolicy;
pub use sinks::{ConversionApiSink, DeliveryPayload, RecordingSink, Sink, SinkRegistry, WebhookSink};
