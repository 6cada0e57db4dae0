//! Change-stream records handed to the external history forwarder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TesseraResult;
use crate::Timestamp;

/// One accepted write. `id` is the physical sort key (`"{type}:{localId}"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub organisation_id: String,
    pub id: String,
    pub revision: u64,
    pub updated_at: Timestamp,
    /// `None` when the written item carries no payload: deletes, and link
    /// writes against a payload-less shadow.
    pub payload: Option<Value>,
}

/// Receives committed changes. Failures are logged by the engine, never
/// surfaced to the writer.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn publish(&self, change: ChangeRecord) -> TesseraResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_change_record_wire_names() {
        let change = ChangeRecord {
            organisation_id: "org".to_string(),
            id: "widget:1".to_string(),
            revision: 2,
            updated_at: Utc::now(),
            payload: None,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["organisationId"], "org");
        assert_eq!(json["revision"], 2);
        assert!(json.get("updatedAt").is_some());
    }
}
