//! Caller identification extractor.
//!
//! Gatekeep sits behind the host application's authentication. The
//! authenticated user id arrives in the `X-User-Id` header, or in a
//! `user_id` query parameter for WebSocket upgrades where browsers cannot
//! set headers. The id must name an active user in the directory.

use std::collections::HashMap;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;

use gatekeep_core::directory::IdentityDirectory;
use gatekeep_types::identity::User;
use gatekeep_types::ids::UserId;

use crate::http::error::AppError;
use crate::state::AppState;

pub const USER_HEADER: &str = "x-user-id";

/// The active directory user making the request.
pub struct Caller(pub User);

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = extract_user_id(parts)?;

        match state.directory.get_user(&user_id).await? {
            Some(user) if user.is_active => Ok(Caller(user)),
            _ => Err(AppError::Unauthorized(format!(
                "User {user_id} is not an active member of any company"
            ))),
        }
    }
}

fn extract_user_id(parts: &Parts) -> Result<UserId, AppError> {
    let raw = match parts.headers.get(USER_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| AppError::Unauthorized("Invalid X-User-Id header encoding".to_string()))?
            .trim()
            .to_string(),
        None => Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(params)| params.get("user_id").cloned())
            .ok_or_else(|| {
                AppError::Unauthorized(
                    "Missing caller. Provide the user id via the 'X-User-Id' header.".to_string(),
                )
            })?,
    };

    raw.parse()
        .map_err(|_| AppError::Unauthorized(format!("'{raw}' is not a valid user id")))
}
