use crate::api::rooms::AppState;
use crate::error::{AppError, Result};
use crate::services::auth::Claims;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

pub struct RequireAuth(pub Claims);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self> {
        // Get token from Authorization header
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let claims = state.auth.verify_token(token)?;

        Ok(RequireAuth(claims))
    }
}
