/// Queue-assigned job identifier (UUID v4).
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Opaque generation parameters forwarded verbatim to the generation API.
pub type Params = serde_json::Map<String, serde_json::Value>;
