use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

use super::media::{MediaRecord, RecordRef, RemoteRecord};

/// Message exchanged between pods. `sequence` is monotonic per (origin, record).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropagationMessage {
    pub origin: String,
    pub sequence: i64,
    pub record_uuid: Uuid,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum MessageBody {
    FullRecord(RemoteRecord),
    QuickUpdate(QuickUpdate),
    Event(RecordEvent),
    Remove,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::FullRecord(_) => "FullRecord",
            MessageBody::QuickUpdate(_) => "QuickUpdate",
            MessageBody::Event(_) => "Event",
            MessageBody::Remove => "Remove",
        }
    }
}

/// Sparse counter values. Present fields carry the owner's absolute value, so
/// applying the same update twice is harmless.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<i64>,
}

impl QuickUpdate {
    pub fn views(views: i64) -> Self {
        Self { views: Some(views) }
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            EventType::View => write!(f, "view"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvent {
    pub event_type: EventType,
    #[serde(default = "default_event_count")]
    pub count: i64,
}

fn default_event_count() -> i64 {
    1
}

/// What the orchestrator hands to the broker inside the committing transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    /// Owned record created or updated: peers get the full record.
    Upserted(Box<MediaRecord>),
    /// Owned record counter changed: peers get a quick update.
    Viewed { record: RecordRef, views: i64 },
    /// A replica was viewed here: its owner gets an event.
    RemoteViewed { record: RecordRef },
    /// Owned record deleted.
    Removed { record: RecordRef },
}
