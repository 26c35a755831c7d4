use axum::{
    debug_handler,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;
use uuid::Uuid;

use crate::{session::DynValidator, store::DynStore, AppResult, AppState};

const DEFAULT_ROOM_NAME: &str = "Retrospective";

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomQuery {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewRoom {
    id: Uuid,
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(store): State<DynStore>,
    State(sessions): State<DynValidator>,
    session: Session,

    Json(NewRoomQuery { name }): Json<NewRoomQuery>,
) -> AppResult<Response> {
    let Ok(user_id) = sessions.validate(&session).await else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    let name = match name.trim() {
        "" => DEFAULT_ROOM_NAME,
        name => name,
    };
    let id = store.create_room(user_id, name).await?;
    info!(room_id = %id, %user_id, "room created");

    Ok(Json(NewRoom { id }).into_response())
}
