use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::repo_types::{RegisteredDevice, UserRecord};

/// Request body for registration. Fields are optional so that a missing
/// field is reported as a validation failure rather than a JSON rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

/// Request body for login.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

/// Returned after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredUser {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl From<&UserRecord> for RegisteredUser {
    fn from(u: &UserRecord) -> Self {
        Self {
            id: u.id.clone(),
            username: u.username.clone(),
            email: u.email.clone(),
        }
    }
}

/// Returned after a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginUser {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Value>,
}

impl From<UserRecord> for LoginUser {
    fn from(mut u: UserRecord) -> Self {
        Self {
            profile: u.fields.remove("profile"),
            preferences: u.fields.remove("preferences"),
            id: u.id,
            username: u.username,
            email: u.email,
        }
    }
}

/// Full record minus the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub registered_device: RegisteredDevice,
    pub allowed_devices: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl From<UserRecord> for UserView {
    fn from(u: UserRecord) -> Self {
        Self {
            id: u.id,
            username: u.username,
            email: u.email,
            created_at: u.created_at,
            registered_device: u.registered_device,
            allowed_devices: u.allowed_devices,
            fields: u.fields,
        }
    }
}

/// Success envelope shared by every account endpoint.
#[derive(Debug, Serialize)]
pub struct AccountResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub user: T,
}

impl<T> AccountResponse<T> {
    pub fn ok(user: T) -> Self {
        Self {
            success: true,
            message: None,
            user,
        }
    }

    pub fn with_message(message: &'static str, user: T) -> Self {
        Self {
            success: true,
            message: Some(message),
            user,
        }
    }
}

/// Failure envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_unauthorized: Option<bool>,
}
