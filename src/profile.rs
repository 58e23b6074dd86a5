use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::cleanup::CleanupJob;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateProfileResponse {
    pub ok: bool,
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileQuery {
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub id: i64,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

/// Identity behind the request's `Authorization` header, or 401.
async fn caller_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, StatusCode> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let identity = match state.identity.resolve(token).await {
        Ok(resolution) => resolution.identity,
        Err(e) => {
            tracing::debug!(error = %e, "Profile request rejected");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    if identity.id == 0 && identity.email.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(identity)
}

/// GET /api/profile - read a profile.
///
/// `?email=` looks up any user; without it the caller's own profile is
/// returned, identified by the bearer token.
pub async fn get_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProfileQuery>,
) -> Result<Json<ProfileResponse>, StatusCode> {
    let lookup = match query.email.filter(|email| !email.is_empty()) {
        Some(email) => ProfileLookup::Email(email),
        None => {
            let identity = caller_identity(&state, &headers).await?;
            if identity.email.is_empty() {
                ProfileLookup::Id(identity.id)
            } else {
                ProfileLookup::Email(identity.email)
            }
        }
    };

    let db = state.db.clone();
    let profile = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let found = match &lookup {
            ProfileLookup::Email(email) => conn.query_row(
                "SELECT id, email, display_name, avatar_url, bio FROM users WHERE email = ?1",
                params![email],
                profile_from_row,
            ),
            ProfileLookup::Id(id) => conn.query_row(
                "SELECT id, email, display_name, avatar_url, bio FROM users WHERE id = ?1",
                params![id],
                profile_from_row,
            ),
        };
        found
            .optional()
            .map_err(|e| {
                tracing::error!(error = %e, "Profile lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::NOT_FOUND)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(profile))
}

enum ProfileLookup {
    Email(String),
    Id(i64),
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileResponse> {
    Ok(ProfileResponse {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        bio: row.get(4)?,
    })
}

/// POST /api/profile - update the caller's display name, avatar and bio.
///
/// The caller is resolved from the bearer token the same way the WebSocket
/// handshake does it. Users known only by email are created on first edit.
pub async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UpdateProfileResponse>, StatusCode> {
    let identity = caller_identity(&state, &headers).await?;

    let db = state.db.clone();
    let avatar_url = req.avatar_url.clone();
    let (id, old_avatar) = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let id = find_or_create_user(&conn, &identity)?;

        let old_avatar: Option<String> = conn
            .query_row(
                "SELECT avatar_url FROM users WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .flatten();

        let updated = conn
            .execute(
                "UPDATE users SET display_name = ?1, avatar_url = ?2, bio = ?3 WHERE id = ?4",
                params![req.display_name, req.avatar_url, req.bio, id],
            )
            .map_err(|e| {
                tracing::error!(user_id = id, error = %e, "Profile update failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
        if updated == 0 {
            return Err(StatusCode::NOT_FOUND);
        }

        Ok::<_, StatusCode>((id, old_avatar))
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    tracing::info!(user_id = id, "Profile updated");

    if let Some(old) = old_avatar.filter(|old| !old.is_empty()) {
        if !avatar_url.is_empty() && old != avatar_url {
            schedule_avatar_cleanup(&state, id, &old);
        }
    }

    Ok(Json(UpdateProfileResponse { ok: true, id }))
}

/// Row id for the identity: its own id, or the row matching its email,
/// created (password-less) when none exists.
fn find_or_create_user(
    conn: &rusqlite::Connection,
    identity: &Identity,
) -> Result<i64, StatusCode> {
    if identity.id != 0 {
        return Ok(identity.id);
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM users WHERE email = ?1",
            params![identity.email],
            |row| row.get(0),
        )
        .optional()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO users (email, display_name) VALUES (?1, ?1)",
        params![identity.email],
    )
    .map_err(|e| {
        tracing::error!(email = %identity.email, error = %e, "Failed to create user");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(conn.last_insert_rowid())
}

fn schedule_avatar_cleanup(state: &AppState, user_id: i64, old_url: &str) {
    let Some(storage) = &state.storage else {
        return;
    };
    let Some(job) = CleanupJob::from_public_url(&storage.base_url, old_url) else {
        tracing::debug!(user_id, url = %old_url, "Old avatar is not a stored object");
        return;
    };
    if let Err(e) = state.cleanup.submit(job) {
        tracing::warn!(user_id, url = %old_url, error = %e, "Dropped avatar cleanup");
    }
}
