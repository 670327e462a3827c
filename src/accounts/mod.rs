use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod handlers;
mod ids;
pub mod password;
pub mod repo_types;
pub mod services;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::account_routes())
}
