use axum::{debug_handler, extract::State, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;
use uuid::Uuid;

use crate::{session::USER_ID, store::DynStore, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct GuestQuery {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct Guest {
    id: Uuid,
    name: String,
}

/// Creates a throwaway user and signs the caller in as it.
#[debug_handler(state = AppState)]
pub(crate) async fn guest(
    State(store): State<DynStore>,
    session: Session,

    Json(GuestQuery { name }): Json<GuestQuery>,
) -> AppResult<Json<Guest>> {
    let name = match name.trim() {
        "" => super::random_alias(),
        name => name.to_owned(),
    };

    let id = store.create_user(&name).await?;
    session.cycle_id().await?;
    session.insert(USER_ID, id.to_string()).await?;
    info!(user_id = %id, %name, "guest signed in");

    Ok(Json(Guest { id, name }))
}
