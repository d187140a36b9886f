//! Reply correlation: matches inbound channel messages to the clicks that
//! produced them and raises downstream jobs.

pub mod engine;
pub mod handler;

pub use engine::{CorrelationEngine, DropReason, Outcome};
pub use handler::CorrelationHandler;
