use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Transcode,
}

impl Display for JobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobType::Transcode => write!(f, "transcode"),
        }
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcode" => Ok(JobType::Transcode),
            _ => Err(anyhow::anyhow!("Invalid job type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(anyhow::anyhow!("Invalid job state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Job {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Job {
            id: row.get("id"),
            job_type: row.get::<String, _>("job_type").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse job_type: {}", e).into())
            })?,
            state: row.get::<String, _>("state").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse state: {}", e).into())
            })?,
            payload: row.get("payload"),
            result: row.get("result"),
            error: row.get("error"),
            attempts: row.get("attempts"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

impl Job {
    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn try_payload_as<P: JobPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Marker trait for typed job payloads.
pub trait JobPayload: Serialize + for<'de> Deserialize<'de> {
    fn job_type() -> JobType;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscodePayload {
    pub record_uuid: Uuid,
}

impl JobPayload for TranscodePayload {
    fn job_type() -> JobType {
        JobType::Transcode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_column_text() {
        for state in [
            JobState::Pending,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!(JobState::Failed.is_finished());
        assert!(!JobState::Active.is_finished());
    }

    #[test]
    fn typed_payload_extraction() {
        let uuid = Uuid::new_v4();
        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::Transcode,
            state: JobState::Pending,
            payload: serde_json::json!({ "record_uuid": uuid }),
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let payload: TranscodePayload = job.try_payload_as().unwrap();
        assert_eq!(payload.record_uuid, uuid);
    }
}
