use std::sync::Arc;

use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    dto::{LoginRequest, LoginUser, RegisterRequest, RegisteredUser, UserView},
    ids::new_id,
    password,
    repo_types::{Document, RegisteredDevice, UserRecord},
};
use crate::storage::RecordStore;

pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Keys the update path never writes. `id` and `createdAt` are immutable,
/// the rest are credentials or the device lock.
const PROTECTED_FIELDS: &[&str] = &[
    "password",
    "passwordHash",
    "allowedDevices",
    "registeredDevice",
    "id",
    "createdAt",
];

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Invalid password")]
    Auth,
    #[error("This account can only be accessed from the device where it was registered")]
    DeviceMismatch { allowed_device: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Register, login, read and update accounts on top of a [`RecordStore`].
///
/// Every read-modify-write runs under `write_lock`, so concurrent requests
/// cannot overwrite each other's changes.
pub struct AccountService {
    store: Arc<dyn RecordStore>,
    write_lock: Mutex<()>,
}

impl AccountService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<RegisteredUser, AccountError> {
        let (Some(username), Some(email), Some(password), Some(device_id)) = (
            present(req.username),
            present(req.email),
            present(req.password),
            present(req.device_id),
        ) else {
            warn!("register missing required fields");
            return Err(missing_fields());
        };
        let device_name = present(req.device_name).unwrap_or_else(|| UNKNOWN_DEVICE.into());

        // Fail fast before paying for the hash; rechecked under the lock below.
        ensure_unique(&self.store.read_all().await, Some(&username), Some(&email), None)?;

        let password_hash = password::hash(password).await?;

        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.read_all().await;
        ensure_unique(&doc, Some(&username), Some(&email), None)?;

        let now = OffsetDateTime::now_utc();
        let record = UserRecord {
            id: new_id(),
            fields: default_fields(&username),
            username,
            email,
            password_hash,
            created_at: now,
            registered_device: RegisteredDevice {
                device_id: device_id.clone(),
                device_name,
                registered_at: now,
            },
            allowed_devices: vec![device_id],
        };
        let user = RegisteredUser::from(&record);
        doc.users.push(record);
        self.persist(doc).await;

        info!(user_id = %user.id, username = %user.username, "user registered");
        Ok(user)
    }

    pub async fn login(&self, req: LoginRequest) -> Result<LoginUser, AccountError> {
        let (Some(username), Some(password), Some(device_id)) = (
            present(req.username),
            present(req.password),
            present(req.device_id),
        ) else {
            warn!("login missing required fields");
            return Err(missing_fields());
        };

        let doc = self.store.read_all().await;
        let Some(user) = doc.users.into_iter().find(|u| u.username == username) else {
            warn!(%username, "login unknown username");
            return Err(AccountError::NotFound("Username not found".into()));
        };

        if !password::verify(password.clone(), user.password_hash.clone()).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AccountError::Auth);
        }

        if !user.allows_device(&device_id) {
            warn!(
                user_id = %user.id,
                %device_id,
                device_name = req.device_name.as_deref().unwrap_or(UNKNOWN_DEVICE),
                "login from unregistered device"
            );
            return Err(AccountError::DeviceMismatch {
                allowed_device: user.registered_device.device_name,
            });
        }

        if password::is_legacy_hash(&user.password_hash) {
            if let Err(e) = self.upgrade_legacy_hash(&user, password).await {
                warn!(user_id = %user.id, error = %e, "legacy password hash upgrade failed");
            }
        }

        info!(user_id = %user.id, %device_id, "user logged in");
        Ok(LoginUser::from(user))
    }

    /// Replace a verified bcrypt hash with an Argon2 one.
    async fn upgrade_legacy_hash(&self, user: &UserRecord, plain: String) -> anyhow::Result<()> {
        let password_hash = password::hash(plain).await?;

        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.read_all().await;
        let Some(stored) = doc
            .users
            .iter_mut()
            .find(|u| u.id == user.id && u.password_hash == user.password_hash)
        else {
            return Ok(());
        };
        stored.password_hash = password_hash;
        self.persist(doc).await;
        info!(user_id = %user.id, "upgraded legacy password hash");
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<UserView, AccountError> {
        self.store
            .read_all()
            .await
            .users
            .into_iter()
            .find(|u| u.id == id)
            .map(UserView::from)
            .ok_or_else(user_not_found)
    }

    /// Shallow-merge `updates` into the stored record. Credentials, the
    /// device lock, `id` and `createdAt` are silently dropped from the payload.
    pub async fn update_user(&self, id: &str, updates: Value) -> Result<UserView, AccountError> {
        let Value::Object(mut updates) = updates else {
            return Err(AccountError::Validation(
                "Update payload must be a JSON object".into(),
            ));
        };
        for key in PROTECTED_FIELDS {
            if updates.remove(*key).is_some() {
                debug!(user_id = %id, field = *key, "dropped protected field from update");
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.read_all().await;
        let idx = doc
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(user_not_found)?;

        let username = take_identity_field(&mut updates, "username")?;
        let email = take_identity_field(&mut updates, "email")?;
        ensure_unique(&doc, username.as_deref(), email.as_deref(), Some(id))?;

        let user = &mut doc.users[idx];
        if let Some(username) = username {
            user.username = username;
        }
        if let Some(email) = email {
            user.email = email;
        }
        user.fields.extend(updates);
        let view = UserView::from(user.clone());
        self.persist(doc).await;

        info!(user_id = %view.id, "user updated");
        Ok(view)
    }

    /// Final best-effort write before the process exits.
    pub async fn shutdown(&self) {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.store.flush().await {
            error!(error = %e, "flushing user document on shutdown failed");
        }
    }

    async fn persist(&self, doc: Document) {
        if let Err(e) = self.store.write_all(doc).await {
            error!(error = %e, "error writing database; keeping in-memory copy");
        }
    }
}

fn present(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

fn missing_fields() -> AccountError {
    AccountError::Validation("Missing required fields".into())
}

fn user_not_found() -> AccountError {
    AccountError::NotFound("User not found".into())
}

fn ensure_unique(
    doc: &Document,
    username: Option<&str>,
    email: Option<&str>,
    except_id: Option<&str>,
) -> Result<(), AccountError> {
    let others = move || doc.users.iter().filter(move |u| Some(u.id.as_str()) != except_id);
    if let Some(username) = username {
        if others().any(|u| u.username == username) {
            warn!(%username, "username already exists");
            return Err(AccountError::Conflict("Username already exists".into()));
        }
    }
    if let Some(email) = email {
        if others().any(|u| u.email == email) {
            warn!(%email, "email already registered");
            return Err(AccountError::Conflict("Email already registered".into()));
        }
    }
    Ok(())
}

fn take_identity_field(
    updates: &mut Map<String, Value>,
    key: &str,
) -> Result<Option<String>, AccountError> {
    match updates.remove(key) {
        None => Ok(None),
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s)),
        Some(_) => Err(AccountError::Validation(format!(
            "{key} must be a non-empty string"
        ))),
    }
}

fn default_fields(username: &str) -> Map<String, Value> {
    match json!({
        "tracks": [],
        "likedTracks": [],
        "playlists": [],
        "preferences": {
            "volume": 70,
            "loopEnabled": false
        },
        "profile": {
            "displayName": username,
            "bio": "Welcome to xiecchuot player!",
            "avatar": "👤",
            "socialMedia": {
                "twitter": "",
                "instagram": "",
                "youtube": ""
            }
        },
        "downloadedTracks": [],
        "followers": [],
        "following": []
    }) {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonFileStore;

    fn service() -> AccountService {
        AccountService::new(Arc::new(JsonFileStore::in_memory()))
    }

    fn register_req(username: &str, email: &str, device_id: &str) -> RegisterRequest {
        RegisterRequest {
            username: Some(username.into()),
            email: Some(email.into()),
            password: Some("pw1".into()),
            device_id: Some(device_id.into()),
            device_name: None,
        }
    }

    fn login_req(username: &str, password: &str, device_id: &str) -> LoginRequest {
        LoginRequest {
            username: Some(username.into()),
            password: Some(password.into()),
            device_id: Some(device_id.into()),
            device_name: None,
        }
    }

    #[tokio::test]
    async fn register_then_login_returns_same_id() {
        let svc = service();
        let created = svc
            .register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        assert_eq!(created.username, "alice");
        assert_eq!(created.email, "a@x.com");

        let logged_in = svc.login(login_req("alice", "pw1", "dev-1")).await.unwrap();
        assert_eq!(logged_in.id, created.id);
        assert_eq!(logged_in.preferences, Some(json!({"volume": 70, "loopEnabled": false})));
        assert_eq!(logged_in.profile.unwrap()["displayName"], "alice");
    }

    #[tokio::test]
    async fn register_requires_all_fields() {
        let svc = service();
        let mut req = register_req("alice", "a@x.com", "dev-1");
        req.password = Some(String::new());
        assert!(matches!(
            svc.register(req).await,
            Err(AccountError::Validation(_))
        ));

        let mut req = register_req("alice", "a@x.com", "dev-1");
        req.device_id = None;
        assert!(matches!(
            svc.register(req).await,
            Err(AccountError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let svc = service();
        svc.register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        let err = svc
            .register(register_req("alice", "other@x.com", "dev-9"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Conflict(ref m) if m == "Username already exists"));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let svc = service();
        svc.register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        let err = svc
            .register(register_req("bob", "a@x.com", "dev-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Conflict(ref m) if m == "Email already registered"));
    }

    #[tokio::test]
    async fn concurrent_duplicate_registrations_create_one_account() {
        let svc = Arc::new(service());
        let a = tokio::spawn({
            let svc = svc.clone();
            async move { svc.register(register_req("alice", "a@x.com", "dev-1")).await }
        });
        let b = tokio::spawn({
            let svc = svc.clone();
            async move { svc.register(register_req("alice", "a2@x.com", "dev-2")).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(svc.store.read_all().await.users.len(), 1);
    }

    #[tokio::test]
    async fn login_failures() {
        let svc = service();
        svc.register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();

        assert!(matches!(
            svc.login(login_req("nobody", "pw1", "dev-1")).await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(
            svc.login(login_req("alice", "wrong", "dev-1")).await,
            Err(AccountError::Auth)
        ));
        assert!(matches!(
            svc.login(LoginRequest::default()).await,
            Err(AccountError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn login_from_other_device_names_registered_device() {
        let svc = service();
        let mut req = register_req("alice", "a@x.com", "dev-1");
        req.device_name = Some("Alice's Phone".into());
        svc.register(req).await.unwrap();

        let err = svc
            .login(login_req("alice", "pw1", "dev-2"))
            .await
            .unwrap_err();
        match err {
            AccountError::DeviceMismatch { allowed_device } => {
                assert_eq!(allowed_device, "Alice's Phone")
            }
            other => panic!("expected device mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_device_name_defaults_to_unknown() {
        let svc = service();
        let created = svc
            .register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        let user = svc.get_user(&created.id).await.unwrap();
        assert_eq!(user.registered_device.device_name, UNKNOWN_DEVICE);
        assert_eq!(user.allowed_devices, vec!["dev-1".to_string()]);
    }

    #[tokio::test]
    async fn failed_disk_write_still_registers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::open(tmp.path().join("missing").join("users_db.json")).await;
        let svc = AccountService::new(Arc::new(store));

        let created = svc
            .register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        let logged_in = svc.login(login_req("alice", "pw1", "dev-1")).await.unwrap();
        assert_eq!(logged_in.id, created.id);
    }

    #[tokio::test]
    async fn legacy_bcrypt_account_logs_in_and_is_rehashed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("users_db.json");
        let legacy = json!({
            "users": [{
                "id": "lx1abc",
                "username": "alice",
                "email": "a@x.com",
                "password": bcrypt::hash("pw1", 4).unwrap(),
                "createdAt": "2024-05-01T10:00:00.000Z",
                "registeredDevice": {
                    "deviceId": "dev-1",
                    "deviceName": "Old Phone",
                    "registeredAt": "2024-05-01T10:00:00.000Z"
                },
                "allowedDevices": ["dev-1"],
                "tracks": []
            }]
        });
        std::fs::write(&path, legacy.to_string()).unwrap();

        let svc = AccountService::new(Arc::new(JsonFileStore::open(&path).await));
        assert!(matches!(
            svc.login(login_req("alice", "wrong", "dev-1")).await,
            Err(AccountError::Auth)
        ));
        let user = svc.login(login_req("alice", "pw1", "dev-1")).await.unwrap();
        assert_eq!(user.id, "lx1abc");

        let doc = svc.store.read_all().await;
        let stored = &doc.users[0];
        assert!(stored.password_hash.starts_with("$argon2"));
        assert_eq!(stored.fields["tracks"], json!([]));
        svc.login(login_req("alice", "pw1", "dev-1")).await.unwrap();
    }

    #[tokio::test]
    async fn get_user_unknown_id() {
        let svc = service();
        assert!(matches!(
            svc.get_user("missing").await,
            Err(AccountError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_ignores_protected_fields() {
        let svc = service();
        let created = svc
            .register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        let before = svc.get_user(&created.id).await.unwrap();

        let updated = svc
            .update_user(
                &created.id,
                json!({
                    "password": "hijacked",
                    "passwordHash": "hijacked",
                    "allowedDevices": ["dev-1", "dev-evil"],
                    "registeredDevice": {"deviceId": "dev-evil", "deviceName": "Evil", "registeredAt": "2020-01-01T00:00:00Z"},
                    "id": "new-id",
                    "bio": "hello",
                    "preferences": {"volume": 10, "loopEnabled": true}
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.allowed_devices, before.allowed_devices);
        assert_eq!(updated.registered_device, before.registered_device);
        assert_eq!(updated.fields["bio"], "hello");
        assert_eq!(updated.fields["preferences"]["volume"], 10);

        // Old password still works, new device still locked out.
        svc.login(login_req("alice", "pw1", "dev-1")).await.unwrap();
        assert!(matches!(
            svc.login(login_req("alice", "hijacked", "dev-1")).await,
            Err(AccountError::Auth)
        ));
        assert!(matches!(
            svc.login(login_req("alice", "pw1", "dev-evil")).await,
            Err(AccountError::DeviceMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn update_rejects_taken_username() {
        let svc = service();
        svc.register(register_req("alice", "a@x.com", "dev-1"))
            .await
            .unwrap();
        let bob = svc
            .register(register_req("bob", "b@x.com", "dev-2"))
            .await
            .unwrap();

        assert!(matches!(
            svc.update_user(&bob.id, json!({"username": "alice"})).await,
            Err(AccountError::Conflict(_))
        ));
        assert!(matches!(
            svc.update_user(&bob.id, json!({"email": 42})).await,
            Err(AccountError::Validation(_))
        ));

        // Renaming to your own current name is fine.
        let same = svc
            .update_user(&bob.id, json!({"username": "bob"}))
            .await
            .unwrap();
        assert_eq!(same.username, "bob");
    }

    #[tokio::test]
    async fn update_unknown_user_and_non_object_payload() {
        let svc = service();
        assert!(matches!(
            svc.update_user("missing", json!({"bio": "x"})).await,
            Err(AccountError::NotFound(_))
        ));
        assert!(matches!(
            svc.update_user("missing", json!([1, 2])).await,
            Err(AccountError::Validation(_))
        ));
    }
}
