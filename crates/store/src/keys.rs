//! Redis key layout.

use tracker_core::types::{IntegrationJob, RouterRef};
use tracker_watermark::Watermark;
use uuid::Uuid;

/// Which selection cursor of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Phone,
    Message,
}

impl CursorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Message => "message",
        }
    }
}

pub fn instance(name: &str) -> String {
    format!("instance:{name}")
}

pub fn campaign(id: Uuid) -> String {
    format!("campaign:{id}")
}

pub fn campaign_slug(slug: &str) -> String {
    format!("campaign:url:{slug}")
}

pub fn campaign_ref(router: &RouterRef) -> String {
    match router {
        RouterRef::Id(id) => campaign(*id),
        RouterRef::CustomUrl(slug) => campaign_slug(slug),
    }
}

pub fn cursor(campaign_id: Uuid, kind: CursorKind) -> String {
    format!("campaign:{campaign_id}:cursor:{}", kind.as_str())
}

pub fn click(id: Uuid) -> String {
    format!("click:{id}")
}

/// Watermark reservation. Keyed by printable digits, never released.
pub fn watermark(code: &Watermark) -> String {
    format!("wm:{}", code.digits())
}

pub fn lead(id: Uuid) -> String {
    format!("lead:{id}")
}

pub fn lead_index(business_id: Uuid, remote_identity: &str) -> String {
    format!("lead:idx:{business_id}:{remote_identity}")
}

pub fn sink(id: Uuid) -> String {
    format!("sink:{id}")
}

pub fn job(job: &IntegrationJob) -> String {
    format!("job:{}:{}", job.click_id, job.sink_kind)
}
