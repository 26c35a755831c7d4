use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tower_sessions::Session;
use tracing::debug;
use uuid::Uuid;

use crate::{
    session::DynValidator,
    store::{DynStore, StoreError},
    AppResult, AppState,
};

/// The room as the caller may see it: during the private phase only their
/// own items are included.
#[debug_handler(state = AppState)]
pub(crate) async fn room(
    State(store): State<DynStore>,
    State(sessions): State<DynValidator>,
    session: Session,
    Path(room_id): Path<Uuid>,
) -> AppResult<Response> {
    let Ok(user_id) = sessions.validate(&session).await else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let mut room = match store.get_room(room_id).await {
        Ok(room) => room,
        Err(StoreError::RoomNotFound) => {
            debug!(%room_id, "room not found");
            return Ok(StatusCode::NOT_FOUND.into_response());
        }
        Err(e) => return Err(e.into()),
    };

    room.privatize_for(user_id);
    Ok(Json(room).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn rooms(
    State(store): State<DynStore>,
    State(sessions): State<DynValidator>,
    session: Session,
) -> AppResult<Response> {
    let Ok(user_id) = sessions.validate(&session).await else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let rooms = store.list_rooms_for_user(user_id).await?;
    Ok(Json(rooms).into_response())
}
