//! Login and token-refresh endpoints.

use crate::auth::{
    jwt::JwtHandler,
    models::{Claims, LoginRequest, LoginResponse, UserResponse},
    user_store::UserStore,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    pub user_store: Arc<UserStore>,
    pub jwt_handler: Arc<JwtHandler>,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthApiError> {
    let valid = state
        .user_store
        .verify_password(&payload.email, &payload.password)
        .map_err(|_| AuthApiError::Internal)?;
    if !valid {
        warn!(email = %payload.email, "Failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    }

    let user = state
        .user_store
        .get_user_by_email(&payload.email)
        .map_err(|_| AuthApiError::Internal)?
        .ok_or(AuthApiError::InvalidCredentials)?;

    let (token, expires_in) = state
        .jwt_handler
        .generate_token(&user)
        .map_err(|_| AuthApiError::Internal)?;

    info!(email = %user.email, "Login successful");
    Ok(Json(LoginResponse {
        success: true,
        token,
        expires_in,
        user: UserResponse {
            id: user.id,
            email: user.email,
            name: user.name,
        },
    }))
}

/// POST /auth/refresh: re-issues a token for a still-valid bearer.
pub async fn refresh(
    State(state): State<AuthState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, AuthApiError> {
    let (token, expires_in) = state
        .jwt_handler
        .refresh_token(&claims)
        .map_err(|_| AuthApiError::Internal)?;
    Ok(Json(json!({
        "success": true,
        "token": token,
        "expires_in": expires_in,
    })))
}

#[derive(Debug)]
pub enum AuthApiError {
    InvalidCredentials,
    Internal,
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid email or password")
            }
            AuthApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };
        (
            status,
            Json(json!({"success": false, "error": message})),
        )
            .into_response()
    }
}
