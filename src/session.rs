use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tower_sessions::Session;
use tracing::warn;
use uuid::Uuid;

pub const USER_ID: &str = "user_id";

pub type DynValidator = Arc<dyn SessionValidator>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no user in session")]
    Missing,

    #[error("malformed user id in session: {0}")]
    Invalid(String),

    #[error(transparent)]
    Session(#[from] tower_sessions::session::Error),
}

/// Resolves who is behind a request.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, session: &Session) -> Result<Uuid, SessionError>;

    /// Forgets the caller; the cookie is dropped on the outgoing response.
    async fn clear(&self, session: &Session);
}

/// Trusts the `user_id` key of the server-side cookie session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieSessionValidator;

#[async_trait]
impl SessionValidator for CookieSessionValidator {
    async fn validate(&self, session: &Session) -> Result<Uuid, SessionError> {
        let user_id = session.get::<String>(USER_ID).await?.ok_or(SessionError::Missing)?;
        Uuid::parse_str(&user_id).map_err(|_| SessionError::Invalid(user_id))
    }

    async fn clear(&self, session: &Session) {
        if let Err(e) = session.flush().await {
            warn!(error = %e, "failed to flush session");
        }
    }
}

#[cfg(test)]
mod tests {
    use tower_sessions::MemoryStore;

    use super::*;

    fn session() -> Session {
        Session::new(None, Arc::new(MemoryStore::default()), None)
    }

    #[tokio::test]
    async fn validates_stored_user() {
        let session = session();
        let user_id = Uuid::now_v7();
        session.insert(USER_ID, user_id.to_string()).await.unwrap();

        assert_eq!(CookieSessionValidator.validate(&session).await.unwrap(), user_id);
    }

    #[tokio::test]
    async fn rejects_missing_and_malformed_users() {
        let session = session();
        let result = CookieSessionValidator.validate(&session).await;
        assert!(matches!(result, Err(SessionError::Missing)));

        session.insert(USER_ID, "not-a-uuid").await.unwrap();
        let result = CookieSessionValidator.validate(&session).await;
        assert!(matches!(result, Err(SessionError::Invalid(_))));
    }

    #[tokio::test]
    async fn clear_forgets_the_user() {
        let session = session();
        session.insert(USER_ID, Uuid::now_v7().to_string()).await.unwrap();

        CookieSessionValidator.clear(&session).await;
        let result = CookieSessionValidator.validate(&session).await;
        assert!(matches!(result, Err(SessionError::Missing)));
    }
}
