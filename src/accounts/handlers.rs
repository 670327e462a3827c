use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, instrument, warn};

use crate::{
    accounts::{
        dto::{
            AccountResponse, ErrorBody, LoginRequest, LoginUser, RegisterRequest, RegisteredUser,
            UserView,
        },
        services::AccountError,
    },
    state::AppState,
};

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/user/:id", get(get_user).put(update_user))
}

/// Failure response: a status code plus the `{success: false, ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                success: false,
                message,
                allowed_device: None,
                device_unauthorized: None,
            },
        }
    }

    fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        let status = match &e {
            AccountError::Validation(_) | AccountError::Conflict(_) => StatusCode::BAD_REQUEST,
            AccountError::NotFound(_) => StatusCode::NOT_FOUND,
            AccountError::Auth => StatusCode::UNAUTHORIZED,
            AccountError::DeviceMismatch { .. } => StatusCode::FORBIDDEN,
            AccountError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = e.to_string();
        let body = match e {
            AccountError::DeviceMismatch { allowed_device } => ErrorBody {
                success: false,
                message,
                allowed_device: Some(allowed_device),
                device_unauthorized: Some(true),
            },
            AccountError::Internal(e) => {
                error!(error = %format!("{e:#}"), "internal error");
                ErrorBody {
                    success: false,
                    message: format!("Server error: {message}"),
                    allowed_device: None,
                    device_unauthorized: None,
                }
            }
            _ => ErrorBody {
                success: false,
                message,
                allowed_device: None,
                device_unauthorized: None,
            },
        };
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// JSON request body whose failures come back as `ApiError`.
///
/// The content type is not checked and an empty body reads as `{}`, so a
/// bare request reaches the service and fails its required-field checks.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        let raw: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &bytes
        };
        serde_json::from_slice(raw).map(JsonBody).map_err(|e| {
            warn!(error = %e, "rejected request body");
            ApiError::bad_request(format!("Invalid request body: {e}"))
        })
    }
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> Result<Json<AccountResponse<RegisteredUser>>, ApiError> {
    let user = state.accounts.register(payload).await?;
    Ok(Json(AccountResponse::with_message(
        "Account created successfully",
        user,
    )))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> Result<Json<AccountResponse<LoginUser>>, ApiError> {
    let user = state.accounts.login(payload).await.map_err(|e| match e {
        // Unknown usernames are a credential failure on this route.
        AccountError::NotFound(_) => ApiError::from(e).with_status(StatusCode::UNAUTHORIZED),
        e => ApiError::from(e),
    })?;
    Ok(Json(AccountResponse::with_message("Login successful", user)))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AccountResponse<UserView>>, ApiError> {
    let user = state.accounts.get_user(&id).await?;
    Ok(Json(AccountResponse::ok(user)))
}

#[instrument(skip(state, updates))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(updates): JsonBody<Value>,
) -> Result<Json<AccountResponse<UserView>>, ApiError> {
    let user = state.accounts.update_user(&id, updates).await?;
    Ok(Json(AccountResponse::ok(user)))
}
