//! Watermark codec shared by the click ingestor and the correlation engine.

pub mod codec;
pub mod generator;

pub use codec::{embed, extract, is_marker, strip, InvalidWatermark, Watermark, ALPHABET};
pub use generator::{CodeRegistry, GenerateError, WatermarkGenerator};
