use axum::{extract::State, http::StatusCode};
use tracing::instrument;

use crate::{
    auth::AuthUser,
    error::AppError,
    extract::{AppJson, AppPath, AppQuery},
    state::AppState,
    users::dto::{
        CreateUserRequest, DataResponse, ListQuery, MessageResponse, UpdateUserRequest, UserPage,
        UserView,
    },
};

type ApiResult<T> = Result<AppJson<T>, AppError>;

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    AppJson(payload): AppJson<CreateUserRequest>,
) -> Result<(StatusCode, AppJson<DataResponse<UserView>>), AppError> {
    let payload = payload.normalize_and_validate()?;
    let user = state.users.create_user(payload).await?;
    Ok((
        StatusCode::CREATED,
        AppJson(DataResponse::with_message("User created successfully", user)),
    ))
}

#[instrument(skip(state, _auth))]
pub async fn list_users(
    State(state): State<AppState>,
    _auth: AuthUser,
    AppQuery(query): AppQuery<ListQuery>,
) -> ApiResult<UserPage> {
    let page = state.users.list_users(query.page, query.limit).await?;
    Ok(AppJson(page))
}

#[instrument(skip(state, auth), fields(user_id = auth.user_id))]
pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<DataResponse<UserView>> {
    let user = state.users.get_user_by_id(auth.user_id).await?;
    Ok(AppJson(DataResponse::new(user)))
}

#[instrument(skip(state, _auth))]
pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    AppPath(id): AppPath<i64>,
) -> ApiResult<DataResponse<UserView>> {
    let user = state.users.get_user_by_id(id).await?;
    Ok(AppJson(DataResponse::new(user)))
}

#[instrument(skip(state, auth, payload), fields(caller = auth.user_id))]
pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthUser,
    AppPath(id): AppPath<i64>,
    AppJson(payload): AppJson<UpdateUserRequest>,
) -> ApiResult<DataResponse<UserView>> {
    auth.require_self_or_superuser(id)?;
    let payload = payload.normalize_and_validate()?;
    let user = state.users.update_user(id, payload).await?;
    Ok(AppJson(DataResponse::with_message(
        "User updated successfully",
        user,
    )))
}

#[instrument(skip(state, auth), fields(caller = auth.user_id))]
pub async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
    AppPath(id): AppPath<i64>,
) -> ApiResult<MessageResponse> {
    auth.require_superuser()?;
    state.users.delete_user(id).await?;
    Ok(AppJson(MessageResponse {
        message: "User deleted successfully",
    }))
}

#[instrument(skip(state, auth), fields(caller = auth.user_id))]
pub async fn verify_email(
    State(state): State<AppState>,
    auth: AuthUser,
    AppPath(id): AppPath<i64>,
) -> ApiResult<DataResponse<UserView>> {
    auth.require_superuser()?;
    let user = state.users.verify_email(id).await?;
    Ok(AppJson(DataResponse::with_message(
        "Email verified successfully",
        user,
    )))
}
