use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body for `PUT /u/{username}/notification_level.json`.
///
/// Discourse models blocking as the "ignore" notification level, which
/// requires an expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLevelRequest {
    pub notification_level: String,
    pub expiring_at: DateTime<Utc>,
}

impl NotificationLevelRequest {
    pub fn ignore_until(expiring_at: DateTime<Utc>) -> Self {
        Self {
            notification_level: "ignore".into(),
            expiring_at,
        }
    }
}
