use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Whether this pod is the authority for a record or holds a replica of it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    Owned,
    Remote,
}

impl Display for Ownership {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Ownership::Owned => write!(f, "owned"),
            Ownership::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for Ownership {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owned" => Ok(Ownership::Owned),
            "remote" => Ok(Ownership::Remote),
            _ => Err(anyhow::anyhow!("Invalid ownership: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Author {
    pub id: i64,
    pub name: String,
    /// None for authors of this pod.
    pub pod_id: Option<i64>,
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// A media record as stored on this pod, either owned or replicated from a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub ownership: Ownership,
    /// Pod that owns a remote record; None when owned here.
    pub origin_pod_id: Option<i64>,
    pub name: String,
    pub category: i32,
    pub licence: i32,
    pub language: Option<i32>,
    pub nsfw: bool,
    pub description: String,
    pub duration: i32,
    pub extname: String,
    pub views: i64,
    pub author_id: i64,
    pub author_name: String,
    pub tags: Vec<String>,
    /// Federation sequence of the last committed mutation.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for MediaRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(MediaRecord {
            id: row.get("id"),
            uuid: row.get("uuid"),
            ownership: row.get::<String, _>("ownership").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse ownership: {}", e).into())
            })?,
            origin_pod_id: row.get("origin_pod_id"),
            name: row.get("name"),
            category: row.get("category"),
            licence: row.get("licence"),
            language: row.get("language"),
            nsfw: row.get("nsfw"),
            description: row.get("description"),
            duration: row.get("duration"),
            extname: row.get("extname"),
            views: row.get("views"),
            author_id: row.get("author_id"),
            author_name: row.get("author_name"),
            tags: row.get::<Vec<String>, _>("tags"),
            sequence: row.get("sequence"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl MediaRecord {
    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub fn record_ref(&self) -> RecordRef {
        RecordRef {
            uuid: self.uuid,
            ownership: self.ownership,
            origin_pod_id: self.origin_pod_id,
            sequence: self.sequence,
        }
    }

    /// Projection sent to peers in a FullRecord message.
    pub fn to_remote(&self) -> RemoteRecord {
        RemoteRecord {
            uuid: self.uuid,
            name: self.name.clone(),
            category: self.category,
            licence: self.licence,
            language: self.language,
            nsfw: self.nsfw,
            description: self.description.clone(),
            duration: self.duration,
            extname: self.extname.clone(),
            views: self.views,
            author: self.author_name.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Apply a patch in place. Absent fields are left untouched.
    pub fn apply_patch(&mut self, patch: &RecordPatch) {
        if let Some(ref name) = patch.name {
            self.name = name.clone();
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(licence) = patch.licence {
            self.licence = licence;
        }
        if let Some(language) = patch.language {
            self.language = Some(language);
        }
        if let Some(nsfw) = patch.nsfw {
            self.nsfw = nsfw;
        }
        if let Some(ref description) = patch.description {
            self.description = description.clone();
        }
        if let Some(ref tags) = patch.tags {
            self.tags = normalize_tags(tags);
        }
    }
}

/// Lightweight reference to a record, handed to the federation broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    pub uuid: Uuid,
    pub ownership: Ownership,
    pub origin_pod_id: Option<i64>,
    pub sequence: i64,
}

/// Record metadata as exchanged between pods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub uuid: Uuid,
    #[validate(length(min = 1, max = 120, message = "Name must be between 1 and 120 characters"))]
    pub name: String,
    pub category: i32,
    pub licence: i32,
    pub language: Option<i32>,
    pub nsfw: bool,
    #[validate(length(max = 10000, message = "Description must be at most 10000 characters"))]
    pub description: String,
    #[validate(range(min = 0, message = "Duration cannot be negative"))]
    pub duration: i32,
    #[validate(length(min = 1, max = 16))]
    pub extname: String,
    #[validate(range(min = 0))]
    pub views: i64,
    #[validate(length(min = 1, max = 64))]
    pub author: String,
    #[validate(length(max = 5, message = "At most 5 tags"))]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload of a create request, already authenticated by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateRecordRequest {
    #[validate(length(min = 1, max = 120, message = "Name must be between 1 and 120 characters"))]
    pub name: String,
    #[validate(range(min = 1, max = 18, message = "Unknown category"))]
    pub category: i32,
    #[validate(range(min = 1, max = 7, message = "Unknown licence"))]
    pub licence: i32,
    pub language: Option<i32>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    #[validate(length(max = 10000, message = "Description must be at most 10000 characters"))]
    pub description: String,
    #[serde(default)]
    #[validate(length(max = 5, message = "At most 5 tags"))]
    pub tags: Vec<String>,
}

/// Partial update of an owned record's descriptive fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RecordPatch {
    #[validate(length(min = 1, max = 120, message = "Name must be between 1 and 120 characters"))]
    pub name: Option<String>,
    #[validate(range(min = 1, max = 18, message = "Unknown category"))]
    pub category: Option<i32>,
    #[validate(range(min = 1, max = 7, message = "Unknown licence"))]
    pub licence: Option<i32>,
    pub language: Option<i32>,
    pub nsfw: Option<bool>,
    #[validate(length(max = 10000, message = "Description must be at most 10000 characters"))]
    pub description: Option<String>,
    #[validate(length(max = 5, message = "At most 5 tags"))]
    pub tags: Option<Vec<String>>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.licence.is_none()
            && self.language.is_none()
            && self.nsfw.is_none()
            && self.description.is_none()
            && self.tags.is_none()
    }
}

/// The uploaded file behind a new record. Bytes stay in storage; only the
/// extension and measured duration reach the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub extname: String,
    pub duration: i32,
}

/// The authenticated local user creating a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub user_id: i64,
    pub username: String,
}

/// Insert-side view of a record, shared by local creates and inbound replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub uuid: Uuid,
    pub ownership: Ownership,
    pub origin_pod_id: Option<i64>,
    pub name: String,
    pub category: i32,
    pub licence: i32,
    pub language: Option<i32>,
    pub nsfw: bool,
    pub description: String,
    pub duration: i32,
    pub extname: String,
    pub views: i64,
    pub author_id: i64,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trim, lowercase and de-duplicate tag names, preserving first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
