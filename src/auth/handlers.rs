use axum::extract::State;
use tracing::{info, instrument, warn};

use crate::{
    auth::dto::{LoginRequest, RefreshRequest, TokenResponse},
    error::AppError,
    extract::AppJson,
    state::AppState,
    users::{dto::normalize, dto::UserView, repo_types::User},
};

fn issue_tokens(state: &AppState, user: &User) -> Result<TokenResponse, AppError> {
    let access_token = state.jwt.sign_access(user)?;
    let refresh_token = state.jwt.sign_refresh(user)?;
    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "Bearer",
        expires_in: state.jwt.access_ttl.as_secs(),
        user: UserView::from(user),
    })
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    AppJson(payload): AppJson<LoginRequest>,
) -> Result<AppJson<TokenResponse>, AppError> {
    let email = normalize(&payload.email);
    if email.is_empty() || payload.password.is_empty() {
        return Err(AppError::bad_request("Email and password are required"));
    }

    let user = state.users.login(&email, payload.password).await?;
    Ok(AppJson(issue_tokens(&state, &user)?))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    AppJson(payload): AppJson<RefreshRequest>,
) -> Result<AppJson<TokenResponse>, AppError> {
    let claims = state.jwt.verify_refresh(&payload.refresh_token).map_err(|e| {
        warn!(error = %e, "refresh rejected");
        AppError::Unauthenticated("Invalid or expired refresh token".into())
    })?;

    // claims are rebuilt from the stored user so privilege changes apply on refresh
    let user = match state.users.find_active(claims.user_id).await {
        Ok(u) => u,
        Err(AppError::NotFound(_)) => {
            warn!(user_id = claims.user_id, "refresh for missing or inactive user");
            return Err(AppError::Unauthenticated("User no longer exists".into()));
        }
        Err(e) => return Err(e),
    };

    info!(user_id = user.id, "tokens refreshed");
    Ok(AppJson(issue_tokens(&state, &user)?))
}
