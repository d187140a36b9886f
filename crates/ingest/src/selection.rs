//! Phone and message selection per campaign strategy.

use std::str::FromStr;
use tracker_core::types::{Campaign, MessageEntry, PhoneEntry};
use tracker_core::{TrackerError, TrackerResult};
use tracker_store::{CursorKind, Store};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Always the first entry.
    Fixed,
    /// Round-robin over a persisted cursor.
    Sequential,
    /// Cumulative draw over entry weights.
    Weighted,
}

impl FromStr for Strategy {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" | "fix" => Ok(Self::Fixed),
            "sequential" => Ok(Self::Sequential),
            "weighted" | "percentage" => Ok(Self::Weighted),
            other => Err(TrackerError::UnsupportedConfig(format!("selection strategy '{other}'"))),
        }
    }
}

pub trait Weighted {
    fn weight(&self) -> f64;
}

impl Weighted for PhoneEntry {
    fn weight(&self) -> f64 {
        self.weight
    }
}

impl Weighted for MessageEntry {
    fn weight(&self) -> f64 {
        self.weight
    }
}

/// Index of the first entry whose cumulative weight exceeds `draw`.
/// Falls back to the first entry when the weights never get there.
pub fn pick_weighted<T: Weighted>(entries: &[T], draw: f64) -> usize {
    let mut acc = 0.0;
    for (i, entry) in entries.iter().enumerate() {
        acc += entry.weight();
        if draw < acc {
            return i;
        }
    }
    0
}

fn check_entries<T>(campaign_id: Uuid, cursor: CursorKind, strategy: &str, entries: &[T]) -> TrackerResult<Strategy> {
    if entries.is_empty() {
        return Err(TrackerError::Validation(format!("campaign {campaign_id} has no {} entries", cursor.as_str())));
    }
    strategy.parse()
}

/// Check both entry lists and both strategies before anything is selected,
/// so a campaign that cannot produce a click never moves its cursors.
pub fn validate_campaign(campaign: &Campaign) -> TrackerResult<()> {
    check_entries(campaign.id, CursorKind::Phone, &campaign.phone_strategy, &campaign.phones)?;
    check_entries(campaign.id, CursorKind::Message, &campaign.message_strategy, &campaign.messages)?;
    Ok(())
}

async fn select_index<T: Weighted>(
    store: &Store,
    campaign_id: Uuid,
    cursor: CursorKind,
    strategy: &str,
    entries: &[T],
    draw: f64,
) -> TrackerResult<usize> {
    match check_entries(campaign_id, cursor, strategy, entries)? {
        Strategy::Fixed => Ok(0),
        Strategy::Sequential => store.advance_cursor(campaign_id, cursor, entries.len()).await,
        Strategy::Weighted => Ok(pick_weighted(entries, draw)),
    }
}

pub async fn select_phone(store: &Store, campaign: &Campaign) -> TrackerResult<String> {
    let draw: f64 = rand::random();
    let index = select_index(
        store,
        campaign.id,
        CursorKind::Phone,
        &campaign.phone_strategy,
        &campaign.phones,
        draw,
    )
    .await?;
    Ok(campaign.phones[index].phone.clone())
}

pub async fn select_message(store: &Store, campaign: &Campaign) -> TrackerResult<String> {
    let draw: f64 = rand::random();
    let index = select_index(
        store,
        campaign.id,
        CursorKind::Message,
        &campaign.message_strategy,
        &campaign.messages,
        draw,
    )
    .await?;
    Ok(campaign.messages[index].text.clone())
}
