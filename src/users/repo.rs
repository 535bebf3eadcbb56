use async_trait::async_trait;
use sqlx::PgPool;

use crate::users::repo_types::{NewUser, RepoResult, User};

const USER_COLUMNS: &str = "id, email, username, hashed_password, is_active, is_superuser, \
     is_email_verified, last_login, created_at, updated_at";

/// Persistence contract for users. Every lookup only sees active rows.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: NewUser) -> RepoResult<User>;
    async fn find_active_by_id(&self, id: i64) -> RepoResult<Option<User>>;
    async fn find_active_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    async fn find_active_by_username(&self, username: &str) -> RepoResult<Option<User>>;
    /// One page ordered by `created_at DESC`, plus the total active count.
    async fn list_active_paged(&self, limit: i64, offset: i64) -> RepoResult<(Vec<User>, i64)>;
    /// Writes the mutable columns of an active user; `None` if no active row matched.
    async fn update(&self, user: &User) -> RepoResult<Option<User>>;
    /// Flips `is_active` off; `false` if no active row matched.
    async fn soft_delete(&self, id: i64) -> RepoResult<bool>;
    async fn touch_last_login(&self, id: i64) -> RepoResult<bool>;
    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: NewUser) -> RepoResult<User> {
        let row = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, username, hashed_password)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.hashed_password)
        .fetch_one(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_active_by_id(&self, id: i64) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND is_active"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_active_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND is_active"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_active_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 AND is_active"
        ))
        .bind(username)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn list_active_paged(&self, limit: i64, offset: i64) -> RepoResult<(Vec<User>, i64)> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE is_active")
            .fetch_one(&self.db)
            .await?;

        // id breaks ties between rows inserted in the same instant
        let rows = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE is_active
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok((rows, total))
    }

    async fn update(&self, user: &User) -> RepoResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET email = $2,
                username = $3,
                hashed_password = $4,
                is_email_verified = $5,
                updated_at = NOW()
            WHERE id = $1 AND is_active
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.hashed_password)
        .bind(user.is_email_verified)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn soft_delete(&self, id: i64) -> RepoResult<bool> {
        let res = sqlx::query(
            "UPDATE users SET is_active = FALSE, updated_at = NOW() WHERE id = $1 AND is_active",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn touch_last_login(&self, id: i64) -> RepoResult<bool> {
        let res = sqlx::query(
            "UPDATE users SET last_login = NOW(), updated_at = NOW() WHERE id = $1 AND is_active",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}
