use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracker_watermark::Watermark;
use uuid::Uuid;

/// Messaging-channel instance (one connected number) mapped to a business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInstance {
    pub name: String,
    #[serde(default)]
    pub business_id: Option<Uuid>,
}

/// A destination phone with its draw weight for weighted selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneEntry {
    pub phone: String,
    #[serde(default, alias = "tax")]
    pub weight: f64,
}

/// A message template with its draw weight for weighted selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub text: String,
    #[serde(default, alias = "tax")]
    pub weight: f64,
}

/// Campaign (router) configuration. Strategy names are kept as stored so an
/// unknown name surfaces at selection time as a configuration problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub business_id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub custom_url: Option<String>,
    pub phones: Vec<PhoneEntry>,
    pub phone_strategy: String,
    pub messages: Vec<MessageEntry>,
    pub message_strategy: String,
    #[serde(default)]
    pub integration_enabled: bool,
    #[serde(default)]
    pub conversion_enabled: bool,
    #[serde(default)]
    pub integration_sink_id: Option<Uuid>,
    #[serde(default)]
    pub conversion_sink_id: Option<Uuid>,
}

impl Campaign {
    /// Sink kinds whose dispatch flag is on, in a stable order.
    pub fn enabled_sinks(&self) -> Vec<SinkKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.integration_enabled {
            kinds.push(SinkKind::Integration);
        }
        if self.conversion_enabled {
            kinds.push(SinkKind::Conversion);
        }
        kinds
    }

    pub fn sink_enabled(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::Integration => self.integration_enabled,
            SinkKind::Conversion => self.conversion_enabled,
        }
    }

    pub fn sink_id(&self, kind: SinkKind) -> Option<Uuid> {
        match kind {
            SinkKind::Integration => self.integration_sink_id,
            SinkKind::Conversion => self.conversion_sink_id,
        }
    }
}

/// How a click addresses its campaign: by id, or by custom slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterRef {
    Id(Uuid),
    CustomUrl(String),
}

impl RouterRef {
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(id) => Self::Id(id),
            Err(_) => Self::CustomUrl(raw.to_string()),
        }
    }
}

impl fmt::Display for RouterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::CustomUrl(slug) => write!(f, "{slug}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtmParams {
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_content: Option<String>,
}

/// One outbound tracking event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Click {
    pub id: Uuid,
    pub business_id: Uuid,
    pub campaign_id: Uuid,
    pub watermark: Watermark,
    pub phone: String,
    pub message: String,
    pub composed_message: String,
    #[serde(default)]
    pub utm: UtmParams,
    pub client_ip: String,
    pub client_user_agent: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub contact_identifier_id: Option<Uuid>,
    #[serde(default)]
    pub remote_identity: Option<String>,
    #[serde(default)]
    pub correlated_at: Option<DateTime<Utc>>,
}

impl Click {
    /// Bound to a lead. Bindings never change afterwards.
    pub fn is_bound(&self) -> bool {
        self.lead_id.is_some()
    }
}

/// A business's view of one messaging contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub business_id: Uuid,
    pub remote_identity: String,
    pub display_name: String,
    #[serde(default)]
    pub last_ip: Option<String>,
    #[serde(default)]
    pub ip_history: Vec<String>,
    #[serde(default)]
    pub last_user_agent: Option<String>,
    #[serde(default)]
    pub user_agent_history: Vec<String>,
    #[serde(default)]
    pub identifier_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// New lead seeded with the visit that produced it.
    pub fn from_click(click: &Click, remote_identity: &str, display_name: String) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            business_id: click.business_id,
            remote_identity: remote_identity.to_string(),
            display_name,
            last_ip: Some(click.client_ip.clone()),
            ip_history: vec![click.client_ip.clone()],
            last_user_agent: Some(click.client_user_agent.clone()),
            user_agent_history: vec![click.client_user_agent.clone()],
            identifier_ids: vec![id],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_visit(&mut self, ip: &str, user_agent: &str) {
        self.last_ip = Some(ip.to_string());
        self.ip_history.push(ip.to_string());
        self.last_user_agent = Some(user_agent.to_string());
        self.user_agent_history.push(user_agent.to_string());
        self.updated_at = Utc::now();
    }
}

/// Downstream dispatch kind raised by a campaign flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Integration,
    Conversion,
}

impl SinkKind {
    pub const ALL: [SinkKind; 2] = [SinkKind::Integration, SinkKind::Conversion];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integration => "integration",
            Self::Conversion => "conversion",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue message asking the dispatch bridge to deliver one click to one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationJob {
    pub click_id: Uuid,
    pub sink_kind: SinkKind,
}

impl IntegrationJob {
    pub fn new(click_id: Uuid, sink_kind: SinkKind) -> Self {
        Self { click_id, sink_kind }
    }

    /// `<click id>:<sink kind>`, also used as the broker de-duplication id.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.click_id, self.sink_kind)
    }
}

/// Outbox state of a job. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Published,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: IntegrationJob,
    pub state: JobState,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Delivery lease held by the handler currently delivering the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<JobClaim>,
}

impl JobRecord {
    pub fn pending(job: IntegrationJob) -> Self {
        let now = Utc::now();
        Self {
            job,
            state: JobState::Pending,
            raised_at: now,
            updated_at: now,
            claim: None,
        }
    }

    /// The claim, if it is still live at `now`.
    pub fn live_claim(&self, now: DateTime<Utc>) -> Option<&JobClaim> {
        self.claim.as_ref().filter(|c| c.expires_at > now)
    }
}

/// Exclusive right to deliver a job until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClaim {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Configured downstream system. `provider` picks the sink implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub id: Uuid,
    pub business_id: Uuid,
    pub provider: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

// ─── Inbound channel events ─────────────────────────────────────────────

/// Message upsert event as emitted by the channel gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub instance: String,
    pub data: InboundData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundData {
    #[serde(default)]
    pub message_type: String,
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageBody>,
    #[serde(default)]
    pub push_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub conversation: Option<String>,
}

impl InboundEvent {
    pub const CONVERSATION: &'static str = "conversation";

    pub fn is_conversation(&self) -> bool {
        self.data.message_type == Self::CONVERSATION
    }

    pub fn text(&self) -> &str {
        self.data
            .message
            .as_ref()
            .and_then(|m| m.conversation.as_deref())
            .unwrap_or_default()
    }

    pub fn remote_identity(&self) -> &str {
        &self.data.key.remote_jid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_event_wire_format() {
        let raw = r#"{
            "instance": "shop-01",
            "data": {
                "messageType": "conversation",
                "key": { "remoteJid": "5511999990000@s.whatsapp.net", "fromMe": false },
                "message": { "conversation": "hello" },
                "pushName": "Ana"
            }
        }"#;
        let event: InboundEvent = serde_json::from_str(raw).unwrap();
        assert!(event.is_conversation());
        assert_eq!(event.text(), "hello");
        assert_eq!(event.remote_identity(), "5511999990000@s.whatsapp.net");
        assert_eq!(event.data.push_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn test_inbound_event_without_message_body() {
        let raw = r#"{"instance":"i","data":{"messageType":"imageMessage","key":{"remoteJid":"r"}}}"#;
        let event: InboundEvent = serde_json::from_str(raw).unwrap();
        assert!(!event.is_conversation());
        assert_eq!(event.text(), "");
        assert!(!event.data.key.from_me);
    }

    #[test]
    fn test_router_ref_parse() {
        let id = Uuid::new_v4();
        assert_eq!(RouterRef::parse(&id.to_string()), RouterRef::Id(id));
        assert_eq!(RouterRef::parse("promo-june"), RouterRef::CustomUrl("promo-june".into()));
    }

    #[test]
    fn test_job_wire_format_and_key() {
        let job = IntegrationJob::new(Uuid::nil(), SinkKind::Conversion);
        let json = serde_json::to_value(job).unwrap();
        assert_eq!(json, serde_json::json!({"clickId": Uuid::nil(), "sinkKind": "conversion"}));
        let parsed: IntegrationJob = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, job);
        assert_eq!(job.idempotency_key(), format!("{}:conversion", Uuid::nil()));
    }

    #[test]
    fn test_job_state_only_moves_forward() {
        assert!(JobState::Pending < JobState::Published);
        assert!(JobState::Published < JobState::Delivered);
    }

    #[test]
    fn test_expired_claim_is_not_live() {
        let now = Utc::now();
        let mut record = JobRecord::pending(IntegrationJob::new(Uuid::nil(), SinkKind::Integration));
        assert!(record.live_claim(now).is_none());

        record.claim = Some(JobClaim {
            owner: Uuid::new_v4(),
            expires_at: now + chrono::Duration::seconds(5),
        });
        assert!(record.live_claim(now).is_some());
        assert!(record.live_claim(now + chrono::Duration::seconds(6)).is_none());

        let legacy: JobRecord = serde_json::from_str(
            &serde_json::to_string(&JobRecord::pending(record.job)).unwrap(),
        )
        .unwrap();
        assert!(legacy.claim.is_none());
    }

    #[test]
    fn test_phone_entry_accepts_legacy_weight_name() {
        let entry: PhoneEntry = serde_json::from_str(r#"{"phone":"5511","tax":0.4}"#).unwrap();
        assert_eq!(entry.weight, 0.4);
    }
}
