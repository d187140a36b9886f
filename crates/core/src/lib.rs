pub mod config;
pub mod error;
pub mod jobs;
pub mod types;

pub use config::AppConfig;
pub use error::{TrackerError, TrackerResult};
pub use jobs::{CaptureJobs, JobPublisher, NoOpPublisher};
