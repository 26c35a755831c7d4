use axum::{
    debug_handler,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{session::DynValidator, AppState};

#[derive(Deserialize)]
pub(crate) struct LogoutQuery {
    pub(crate) return_url: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn logout(
    Query(LogoutQuery { return_url }): Query<LogoutQuery>,
    State(sessions): State<DynValidator>,
    session: Session,
) -> Response {
    sessions.clear(&session).await;

    match return_url {
        Some(return_url) => Redirect::to(&return_url).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
