use sqlx::FromRow;
use time::OffsetDateTime;

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,                              // assigned by BIGSERIAL
    pub email: String,                        // lowercase, unique among active users
    pub username: String,                     // lowercase, unique among active users
    pub hashed_password: String,              // Argon2 PHC string, never serialized
    pub is_active: bool,                      // false = soft-deleted
    pub is_superuser: bool,
    pub is_email_verified: bool,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Insert payload; flags take their column defaults.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub hashed_password: String,
}

/// Column guarded by an active-scoped unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    Username,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("unique constraint violated on {0:?}")]
    UniqueViolation(UniqueField),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                let field = match db.constraint() {
                    Some(c) if c.contains("username") => UniqueField::Username,
                    _ => UniqueField::Email,
                };
                return Self::UniqueViolation(field);
            }
        }
        Self::Backend(e.into())
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
