use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::domain::Session;
use crate::services::StartSessionRequest;

/// POST /api/server-game-configs/:sgc_id/sessions
pub async fn start_session(
    State(state): State<AppState>,
    Path(sgc_id): Path<i64>,
    Json(body): Json<StartSessionBody>,
) -> std::result::Result<(StatusCode, Json<Session>), ApiError> {
    let request = StartSessionRequest {
        sgc_id,
        parameters: body.parameters,
        force: body.force,
        restore_backup_id: body.restore_backup_id,
    };
    let session = state
        .handler
        .start_session(request, &state.request_token())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/server-game-configs/:sgc_id/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(sgc_id): Path<i64>,
    Query(query): Query<SessionListQuery>,
) -> ApiResult<Vec<Session>> {
    let statuses = query.statuses()?;
    let sessions = state
        .handler
        .list_sessions(sgc_id, statuses.as_deref())
        .await?;
    Ok(Json(sessions))
}

/// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> ApiResult<Session> {
    Ok(Json(state.handler.get_session(session_id).await?))
}

/// POST /api/sessions/:id/stop
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> ApiResult<Session> {
    let session = state
        .handler
        .stop_session(session_id, &state.request_token())
        .await?;
    Ok(Json(session))
}

/// POST /api/sessions/:id/input
pub async fn send_input(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    Json(body): Json<SendInputBody>,
) -> std::result::Result<StatusCode, ApiError> {
    state
        .handler
        .send_input(session_id, body.bytes()?, &state.request_token())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
