use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use uuid::Uuid;

/// Opaque identifier of a scheduled notification job.
///
/// The identifier is the member stored in the due-time queue and the suffix
/// of the payload key in the payload store.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier for a new job.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Due time of a job in seconds since the Unix epoch.
///
/// This is the score the job is indexed under in the due-time queue.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DueTime(pub f64);

impl DueTime {
    /// Current wall-clock time truncated to whole seconds.
    pub fn now() -> Self {
        Self(Utc::now().timestamp() as f64)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis() as f64 / 1000.0)
    }

    /// Shift by a signed number of seconds.
    pub fn offset_secs(self, secs: i64) -> Self {
        Self(self.0 + secs as f64)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt((self.0 * 1000.0) as i64).single()
    }
}

impl Display for DueTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job identifier together with the score it was found under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DueEntry {
    pub job_id: JobId,
    pub due_time: DueTime,
}

impl DueEntry {
    pub fn new(job_id: impl Into<JobId>, due_time: DueTime) -> Self {
        Self {
            job_id: job_id.into(),
            due_time,
        }
    }
}

/// Notification content stored alongside a job.
///
/// Serialized as JSON by producers. Every field is optional on the wire and
/// defaults to empty when absent or `null`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPayload {
    #[serde(deserialize_with = "null_as_default")]
    pub tokens: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(deserialize_with = "null_as_default")]
    pub data: HashMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl NotificationPayload {
    pub fn new(
        tokens: Vec<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            title: title.into(),
            body: body.into(),
            data: HashMap::new(),
        }
    }

    pub fn with_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn has_recipients(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Per-job result of one pass through the claim loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Removed from the queue by this caller, not yet materialized.
    Claimed,
    /// Another claimer removed the entry first.
    AlreadyClaimed,
    /// Claimed, but the payload key was missing.
    Orphaned,
    /// Claimed, but the payload could not be decoded.
    Malformed,
    /// Claimed, but reading the payload failed; the job was dropped.
    Transient,
    /// Claimed, reading the payload failed and the job was put back.
    Requeued,
    /// Claimed and handed to the dispatcher.
    Dispatched,
}

impl ClaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::AlreadyClaimed => "already_claimed",
            ClaimOutcome::Orphaned => "orphaned",
            ClaimOutcome::Malformed => "malformed",
            ClaimOutcome::Transient => "transient",
            ClaimOutcome::Requeued => "requeued",
            ClaimOutcome::Dispatched => "dispatched",
        }
    }

    /// Whether this caller won ownership of the job.
    pub fn is_owned(&self) -> bool {
        !matches!(self, ClaimOutcome::AlreadyClaimed)
    }
}

impl Display for ClaimOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults_absent_fields() {
        let payload = NotificationPayload::from_json(
            r#"{"tokens":["tok-a"],"title":"Hi","body":"There"}"#,
        )
        .unwrap();

        assert_eq!(payload.tokens, vec!["tok-a".to_string()]);
        assert_eq!(payload.title, "Hi");
        assert_eq!(payload.body, "There");
        assert!(payload.data.is_empty());
    }

    #[test]
    fn test_payload_null_fields_decode_as_empty() {
        let payload = NotificationPayload::from_json(
            r#"{"tokens":["tok-a"],"title":"Hi","body":"There","data":null}"#,
        )
        .unwrap();
        assert_eq!(payload.tokens, vec!["tok-a".to_string()]);
        assert!(payload.data.is_empty());

        let payload = NotificationPayload::from_json(
            r#"{"tokens":null,"title":null,"body":null,"data":null}"#,
        )
        .unwrap();
        assert_eq!(payload, NotificationPayload::default());
        assert!(!payload.has_recipients());
    }

    #[test]
    fn test_payload_round_trip_preserves_fields() {
        let payload = NotificationPayload::new(
            vec!["tok-a".into(), "tok-b".into()],
            "Reminder",
            "Stand up",
        )
        .with_data("screen", "tasks")
        .with_data("task_id", "42");

        let decoded =
            NotificationPayload::from_json(&payload.to_json().unwrap())
                .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_payload_empty_object_decodes() {
        let payload = NotificationPayload::from_json("{}").unwrap();
        assert_eq!(payload, NotificationPayload::default());
        assert!(!payload.has_recipients());
    }

    #[test]
    fn test_payload_rejects_wrong_shape() {
        assert!(NotificationPayload::from_json(r#"{"tokens":"tok-a"}"#).is_err());
        assert!(NotificationPayload::from_json("not json").is_err());
    }

    #[test]
    fn test_due_time_offsets() {
        let now = DueTime(1_700_000_000.0);
        assert_eq!(now.offset_secs(-10).as_secs(), 1_699_999_990.0);
        assert!(now.offset_secs(10) > now);
    }

    #[test]
    fn test_due_time_datetime_conversion() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let due = DueTime::from_datetime(at);
        assert_eq!(due.to_datetime(), Some(at));
    }

    #[test]
    fn test_claim_outcome_ownership() {
        assert!(!ClaimOutcome::AlreadyClaimed.is_owned());
        assert!(ClaimOutcome::Orphaned.is_owned());
        assert_eq!(ClaimOutcome::Dispatched.to_string(), "dispatched");
    }
}
