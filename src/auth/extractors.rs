use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::warn;

use super::{claims::TokenKind, jwt::JwtKeys};
use crate::error::AppError;

/// Identity of the caller, taken from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
    pub email: String,
    pub username: String,
    pub is_superuser: bool,
}

impl AuthUser {
    pub fn require_self_or_superuser(&self, target_id: i64) -> Result<(), AppError> {
        if self.user_id == target_id || self.is_superuser {
            return Ok(());
        }
        warn!(user_id = self.user_id, target_id, "forbidden: not owner or superuser");
        Err(AppError::Forbidden(
            "You can only modify your own account".into(),
        ))
    }

    pub fn require_superuser(&self) -> Result<(), AppError> {
        if self.is_superuser {
            return Ok(());
        }
        warn!(user_id = self.user_id, "forbidden: superuser required");
        Err(AppError::Forbidden("Superuser privileges required".into()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<JwtKeys>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = Arc::<JwtKeys>::from_ref(state);
        let auth = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| AppError::Unauthenticated("Missing Authorization header".into()))?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthenticated("Invalid Authorization header".into()))?;

        let claims = keys.verify(token).map_err(|e| {
            warn!(error = %e, "invalid or expired token");
            AppError::Unauthenticated("Invalid or expired token".into())
        })?;

        if claims.kind != TokenKind::Access {
            return Err(AppError::Unauthenticated("Access token required".into()));
        }

        Ok(AuthUser {
            user_id: claims.user_id,
            email: claims.email,
            username: claims.username,
            is_superuser: claims.is_superuser,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::AppState, testing::sample_user};
    use axum::http::{Request, StatusCode};

    fn parts_with(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/users/me");
        if let Some(v) = auth {
            builder = builder.header(AUTHORIZATION, v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    async fn extract(state: &AppState, auth: Option<&str>) -> Result<AuthUser, AppError> {
        let mut parts = parts_with(auth);
        AuthUser::from_request_parts(&mut parts, state).await
    }

    #[tokio::test]
    async fn access_token_yields_identity() {
        let state = AppState::fake();
        let token = state.jwt.sign_access(&sample_user(5, true)).unwrap();
        let user = extract(&state, Some(&format!("Bearer {token}"))).await.unwrap();
        assert_eq!(user.user_id, 5);
        assert!(user.is_superuser);
    }

    #[tokio::test]
    async fn missing_or_malformed_header_is_unauthenticated() {
        let state = AppState::fake();
        for header in [None, Some("Basic abc"), Some("Bearer "), Some("Bearer not.a.jwt")] {
            let err = extract(&state, header).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED, "header {header:?}");
        }
    }

    #[tokio::test]
    async fn refresh_token_is_not_accepted_as_access() {
        let state = AppState::fake();
        let token = state.jwt.sign_refresh(&sample_user(5, false)).unwrap();
        let err = extract(&state, Some(&format!("Bearer {token}"))).await.unwrap_err();
        assert_eq!(err.to_string(), "Access token required");
    }

    #[test]
    fn authorization_gates() {
        let user = AuthUser {
            user_id: 1,
            email: "a@x.com".into(),
            username: "alice".into(),
            is_superuser: false,
        };
        assert!(user.require_self_or_superuser(1).is_ok());
        assert!(matches!(
            user.require_self_or_superuser(2),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(user.require_superuser(), Err(AppError::Forbidden(_))));

        let admin = AuthUser {
            is_superuser: true,
            ..user
        };
        assert!(admin.require_self_or_superuser(2).is_ok());
        assert!(admin.require_superuser().is_ok());
    }
}
