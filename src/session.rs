use axum::{extract::FromRequestParts, http::request::Parts};
use tower_sessions::Session;

use crate::{
    appresult::AppError,
    error::ChatError,
    identity::{Identity, Role},
};

pub const EMAIL: &str = "email";
pub const USER_TYPE: &str = "user_type";

/// The party signed in on this request's session.
pub struct CurrentIdentity(pub Identity);

impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| anyhow::anyhow!(msg))?;

        let email = session.get::<String>(EMAIL).await?;
        let role = session.get::<Role>(USER_TYPE).await?;
        let (Some(email), Some(role)) = (email, role) else {
            return Err(ChatError::Unauthenticated.into());
        };
        Ok(Self(Identity::new(email, role)?))
    }
}
