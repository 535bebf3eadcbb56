use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{AppError, FieldError};
use crate::users::repo_types::User;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// Public part of the user returned to clients and stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub is_email_verified: bool,
    #[serde(
        with = "time::serde::rfc3339::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_login: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            username: u.username.clone(),
            is_active: u.is_active,
            is_superuser: u.is_superuser,
            is_email_verified: u.is_email_verified,
            last_login: u.last_login,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

/// Request body for `POST /users`.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

impl CreateUserRequest {
    /// Trims and lowercases identifiers, then checks every field.
    pub fn normalize_and_validate(mut self) -> Result<Self, AppError> {
        self.email = normalize(&self.email);
        self.username = normalize(&self.username);

        let mut errors = Vec::new();
        check_email(&self.email, &mut errors);
        check_username(&self.username, &mut errors);
        check_password(&self.password, &mut errors);
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(AppError::validation(errors))
        }
    }
}

/// Request body for `PUT /users/:id`; absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpdateUserRequest {
    pub fn normalize_and_validate(mut self) -> Result<Self, AppError> {
        self.email = self.email.as_deref().map(normalize);
        self.username = self.username.as_deref().map(normalize);

        let mut errors = Vec::new();
        if let Some(email) = &self.email {
            check_email(email, &mut errors);
        }
        if let Some(username) = &self.username {
            check_username(username, &mut errors);
        }
        if let Some(password) = &self.password {
            check_password(password, &mut errors);
        }
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(AppError::validation(errors))
        }
    }
}

/// `?page=&limit=`; out-of-range values are clamped by the service, not rejected.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(total: i64, page: i64, limit: i64) -> Self {
        let total_pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
        Self {
            total,
            page,
            limit,
            total_pages,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserPage {
    pub data: Vec<UserView>,
    pub pagination: Pagination,
}

/// `{"data": ..., "message": ...}` success envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            message: None,
            data,
        }
    }

    pub fn with_message(message: &'static str, data: T) -> Self {
        Self {
            message: Some(message),
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

pub(crate) fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex =
            Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex compiles");
    }
    email.len() <= 255 && EMAIL_RE.is_match(email)
}

fn check_email(email: &str, errors: &mut Vec<FieldError>) {
    if !is_valid_email(email) {
        errors.push(FieldError::new("email", "Invalid email address"));
    }
}

fn check_username(username: &str, errors: &mut Vec<FieldError>) {
    let len = username.chars().count();
    if !(3..=50).contains(&len) {
        errors.push(FieldError::new(
            "username",
            "Username must be between 3 and 50 characters",
        ));
    } else if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        errors.push(FieldError::new(
            "username",
            "Username can only contain letters, numbers, and underscores",
        ));
    }
}

fn check_password(password: &str, errors: &mut Vec<FieldError>) {
    let len = password.chars().count();
    if !(8..=100).contains(&len) {
        errors.push(FieldError::new(
            "password",
            "Password must be between 8 and 100 characters",
        ));
        return;
    }
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        errors.push(FieldError::new(
            "password",
            "Password must contain an uppercase letter, a lowercase letter and a digit",
        ));
    }
}
