use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{RequestId, RideRequest, UserId},
    error::ApiError,
};

/// Logical path of the shared ride request log.
pub const FEED_PATH: &str = "messages";

/// A ride request as stored under its key, without the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub author: UserId,
    pub author_label: String,
    pub pickup_location: String,
    pub dropoff_location: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: RequestId,
    #[serde(flatten)]
    pub record: SnapshotRecord,
}

impl SnapshotEntry {
    pub fn into_ride_request(self) -> RideRequest {
        RideRequest {
            id: self.id,
            author: self.record.author,
            author_label: self.record.author_label,
            pickup_location: self.record.pickup_location,
            dropoff_location: self.record.dropoff_location,
            created_at: self.record.created_at,
        }
    }
}

impl From<RideRequest> for SnapshotEntry {
    fn from(value: RideRequest) -> Self {
        Self {
            id: value.id,
            record: SnapshotRecord {
                author: value.author,
                author_label: value.author_label,
                pickup_location: value.pickup_location,
                dropoff_location: value.dropoff_location,
                created_at: value.created_at,
            },
        }
    }
}

/// Full contents of the request log, in the order the store keeps it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub entries: Vec<SnapshotEntry>,
}

impl FeedSnapshot {
    pub fn new(entries: Vec<SnapshotEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<SnapshotEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<SnapshotEntry>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub user_id: UserId,
    pub email: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRideRequest {
    pub pickup_location: String,
    pub dropoff_location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    FeedSnapshot { snapshot: FeedSnapshot },
    Error(ApiError),
}
