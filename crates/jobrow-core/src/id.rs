//! Job identifiers.

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Identity of a job row, assigned at enqueue time and never changed.
///
/// Ids are UUIDv7, so they order by creation time. The claim order falls
/// back on that ordering when priority and `created_at` tie.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The creation instant carried by a v7 id. `None` for ids of other
    /// versions, e.g. rows written by another producer.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::InvalidJobId {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_sort_by_creation() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
    }

    #[test]
    fn test_parse_accepts_display_form() {
        let id = JobId::new();
        let parsed: JobId = format!(" {id} ").parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = "not-a-job".parse::<JobId>().unwrap_err();
        assert!(matches!(err, Error::InvalidJobId { ref input, .. } if input == "not-a-job"));
    }

    #[test]
    fn test_created_at_comes_from_the_id() {
        let before = Utc::now() - chrono::Duration::seconds(1);
        let created = JobId::new().created_at().unwrap();
        assert!(created >= before && created <= Utc::now());
        assert!(JobId::from_uuid(Uuid::new_v4()).created_at().is_none());
    }
}
