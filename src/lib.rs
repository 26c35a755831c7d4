pub mod appresult;
pub mod auth;
pub mod config;
pub mod hub;
pub mod rooms;
pub mod session;
pub mod store;

use std::sync::Arc;

use axum::{extract::FromRef, Router};
use tower_http::trace::TraceLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};

use crate::{
    config::{Config, ConnectionLimits},
    hub::Hub,
    session::{CookieSessionValidator, DynValidator},
    store::DynStore,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: DynStore,
    pub hub: Hub,
    pub sessions: DynValidator,
    pub limits: ConnectionLimits,
}

impl AppState {
    /// State backed by the cookie session validator.
    pub fn new(store: DynStore, hub: Hub, limits: ConnectionLimits) -> Self {
        Self {
            store,
            hub,
            sessions: Arc::new(CookieSessionValidator),
            limits,
        }
    }
}

pub fn router(state: AppState, config: &Config) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(config.cookie_secure)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(config.session_idle_minutes)));

    Router::new()
        .merge(auth::router())
        .nest("/r", rooms::router())
        .with_state(state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
}
