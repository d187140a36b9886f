//! Click entry: campaign variant selection and watermarked click creation.

pub mod ingestor;
pub mod selection;

pub use ingestor::{whatsapp_url, ClickIngestor, ClickRequest, ClickResponse};
pub use selection::{pick_weighted, select_message, select_phone, validate_campaign, Strategy};
