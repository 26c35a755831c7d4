pub mod connection;
pub mod events;
mod new;
mod room;
mod ws;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(room::rooms))
        .route("/new", post(new::new_room))
        .route("/{uuid}", get(room::room))
        .route("/{uuid}/ws", get(ws::room_ws))
}
