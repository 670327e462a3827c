use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// The whole persisted state: every user record in one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

/// Device captured at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub device_id: String,
    pub device_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

/// User record as stored in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(alias = "password")]
    pub password_hash: String, // Argon2 PHC string, never leaves the service
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub registered_device: RegisteredDevice,
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    /// Profile, preferences and collections. Opaque, stored verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl UserRecord {
    pub fn allows_device(&self, device_id: &str) -> bool {
        self.allowed_devices.iter().any(|d| d == device_id)
    }
}
