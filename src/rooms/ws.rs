use axum::{
    debug_handler,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::{
    AppError, AppResult, AppState,
    db::UserId,
    hub::Scope,
    session::{self, SessionGrant},
};

/// Browsers cannot set headers on a websocket handshake, so the bearer token
/// rides in the query string.
#[derive(Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

#[debug_handler]
pub async fn room_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<TokenQuery>,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let grant = authorize_room(&state, query.token.as_deref(), &room_id).await?;
    Ok(upgrade(ws, state, grant))
}

#[debug_handler]
pub async fn presence_ws(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Query(query): Query<TokenQuery>,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let grant = authorize_presence(&state, query.token.as_deref(), &workspace_id).await?;
    Ok(upgrade(ws, state, grant))
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, grant: SessionGrant) -> Response {
    let max = state.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| session::serve(socket, state, grant))
}

async fn authenticate(state: &AppState, token: Option<&str>) -> AppResult<UserId> {
    let token = token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing token".to_owned()))?;

    state
        .authenticator
        .authenticate(token)
        .await?
        .ok_or_else(|| AppError::Unauthorized("invalid token".to_owned()))
}

fn parse_id(raw: &str, what: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("malformed {what} id")))
}

async fn authorize_room(
    state: &AppState,
    token: Option<&str>,
    raw_room_id: &str,
) -> AppResult<SessionGrant> {
    let user_id = authenticate(state, token).await?;
    let room_id = parse_id(raw_room_id, "room")?;

    let room = state
        .repo
        .find_room(room_id)
        .await?
        .ok_or_else(|| AppError::NotFound("room not found".to_owned()))?;
    if !room.participants.contains(&user_id) {
        debug!(%user_id, %room_id, "upgrade refused for non-participant");
        return Err(AppError::Forbidden("not a participant of this room".to_owned()));
    }

    Ok(SessionGrant {
        user_id,
        workspace_id: room.workspace_id,
        scope: Scope::Room(room_id),
    })
}

async fn authorize_presence(
    state: &AppState,
    token: Option<&str>,
    raw_workspace_id: &str,
) -> AppResult<SessionGrant> {
    let user_id = authenticate(state, token).await?;
    let workspace_id = parse_id(raw_workspace_id, "workspace")?;

    if !state.authorizer.is_member(user_id, workspace_id).await? {
        debug!(%user_id, %workspace_id, "upgrade refused for non-member");
        return Err(AppError::Forbidden("not a member of this workspace".to_owned()));
    }

    Ok(SessionGrant {
        user_id,
        workspace_id,
        scope: Scope::Presence(workspace_id),
    })
}
