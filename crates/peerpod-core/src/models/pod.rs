use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::FEDERATION_INBOX_PATH;

/// A friend pod this pod replicates to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Pod {
    pub id: i64,
    /// host[:port] used both as delivery target and as the wire origin identifier.
    pub host: String,
    #[serde(skip_serializing)]
    pub shared_secret: String,
    pub score: i32,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Pod {
    pub fn inbox_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}{}", host, FEDERATION_INBOX_PATH)
        } else {
            format!("http://{}{}", host, FEDERATION_INBOX_PATH)
        }
    }
}

/// Handshake data for a new friend pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPod {
    pub host: String,
    pub shared_secret: String,
}

/// A message waiting in a peer's outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct OutboxEntry {
    /// Enqueue order; a peer's queue drains by ascending id.
    pub id: i64,
    pub pod_id: i64,
    pub record_uuid: Uuid,
    pub sequence: i64,
    pub message: serde_json::Value,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
