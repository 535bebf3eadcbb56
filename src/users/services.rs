use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    auth::password::{hash_password, verify_password},
    cache::CacheManager,
    error::{conflict_message, AppError},
    users::{
        dto::{
            CreateUserRequest, Pagination, UpdateUserRequest, UserPage, UserView, DEFAULT_LIMIT,
            DEFAULT_PAGE, MAX_LIMIT,
        },
        repo::UserRepository,
        repo_types::{NewUser, UniqueField, User},
    },
};

pub const USER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub fn user_cache_key(id: i64) -> String {
    format!("user:{id}")
}

/// Out-of-range paging input falls back to the defaults instead of failing.
pub fn clamp_paging(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.filter(|p| *p >= 1).unwrap_or(DEFAULT_PAGE);
    let limit = limit
        .filter(|l| (1..=MAX_LIMIT).contains(l))
        .unwrap_or(DEFAULT_LIMIT);
    (page, limit)
}

/// Business rules for users: uniqueness, cache-aside reads and
/// invalidate-on-write.
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
    cache: CacheManager,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>, cache: CacheManager) -> Self {
        Self { repo, cache }
    }

    #[instrument(skip(self, req), fields(email = %req.email, username = %req.username))]
    pub async fn create_user(&self, req: CreateUserRequest) -> Result<UserView, AppError> {
        self.ensure_email_free(&req.email).await?;
        self.ensure_username_free(&req.username).await?;

        let hashed_password = hash_blocking(req.password).await?;
        let user = self
            .repo
            .create(NewUser {
                email: req.email,
                username: req.username,
                hashed_password,
            })
            .await?;

        info!(user_id = user.id, "user created");
        Ok(UserView::from(&user))
    }

    #[instrument(skip(self))]
    pub async fn get_user_by_id(&self, id: i64) -> Result<UserView, AppError> {
        let key = user_cache_key(id);
        match self.cache.get_json::<UserView>(&key).await {
            Ok(Some(view)) => {
                debug!(user_id = id, "user served from cache");
                return Ok(view);
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = id, error = %e, "cache read failed; falling back to store"),
        }

        let user = self.find_active(id).await?;
        let view = UserView::from(&user);
        if let Err(e) = self.cache.set_json(&key, &view, USER_CACHE_TTL).await {
            warn!(user_id = id, error = %e, "cache write failed");
        }
        Ok(view)
    }

    #[instrument(skip(self))]
    pub async fn list_users(
        &self,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> Result<UserPage, AppError> {
        let (page, limit) = clamp_paging(page, limit);
        // pages far past the end saturate instead of overflowing
        let offset = (page - 1).saturating_mul(limit);
        let (users, total) = self
            .repo
            .list_active_paged(limit, offset)
            .await
            .map_err(|e| {
                error!(page, limit, error = %e, "list_active_paged failed");
                e
            })?;

        Ok(UserPage {
            data: users.iter().map(UserView::from).collect(),
            pagination: Pagination::new(total, page, limit),
        })
    }

    #[instrument(skip(self, req))]
    pub async fn update_user(&self, id: i64, req: UpdateUserRequest) -> Result<UserView, AppError> {
        let mut user = self.find_active(id).await?;

        if let Some(email) = req.email {
            if email != user.email {
                self.ensure_email_free(&email).await?;
                user.email = email;
            }
        }
        if let Some(username) = req.username {
            if username != user.username {
                self.ensure_username_free(&username).await?;
                user.username = username;
            }
        }
        if let Some(password) = req.password {
            user.hashed_password = hash_blocking(password).await?;
        }

        let written = self.repo.update(&user).await;
        self.invalidate(id).await;
        let updated = written?.ok_or_else(AppError::user_not_found)?;

        info!(user_id = id, "user updated");
        Ok(UserView::from(&updated))
    }

    /// Soft delete. Unknown or already deleted ids are `NotFound`.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: i64) -> Result<(), AppError> {
        let deleted = self.repo.soft_delete(id).await;
        self.invalidate(id).await;
        if !deleted? {
            return Err(AppError::user_not_found());
        }
        info!(user_id = id, "user soft-deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn verify_email(&self, id: i64) -> Result<UserView, AppError> {
        let mut user = self.find_active(id).await?;
        user.is_email_verified = true;

        let written = self.repo.update(&user).await;
        self.invalidate(id).await;
        let updated = written?.ok_or_else(AppError::user_not_found)?;

        info!(user_id = id, "email verified");
        Ok(UserView::from(&updated))
    }

    #[instrument(skip(self))]
    pub async fn touch_last_login(&self, id: i64) -> Result<(), AppError> {
        let touched = self.repo.touch_last_login(id).await;
        self.invalidate(id).await;
        if !touched? {
            return Err(AppError::user_not_found());
        }
        Ok(())
    }

    /// Checks credentials and records the login. Unknown email and wrong
    /// password fail identically.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: String) -> Result<User, AppError> {
        let invalid = || AppError::Unauthenticated("Invalid email or password".into());

        let Some(user) = self.repo.find_active_by_email(email).await? else {
            warn!(email, "login for unknown email");
            return Err(invalid());
        };

        let hash = user.hashed_password.clone();
        let ok = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .context("password verification task failed")??;
        if !ok {
            warn!(user_id = user.id, "login with wrong password");
            return Err(invalid());
        }

        self.touch_last_login(user.id).await?;
        let user = self.find_active(user.id).await?;
        info!(user_id = user.id, "user logged in");
        Ok(user)
    }

    /// Full record of an active user, bypassing the cache.
    pub async fn find_active(&self, id: i64) -> Result<User, AppError> {
        self.repo
            .find_active_by_id(id)
            .await
            .map_err(|e| {
                error!(user_id = id, error = %e, "find_active_by_id failed");
                e
            })?
            .ok_or_else(AppError::user_not_found)
    }

    pub async fn check_database(&self) -> anyhow::Result<()> {
        self.repo.ping().await
    }

    pub async fn check_cache(&self) -> anyhow::Result<()> {
        self.cache.ping().await
    }

    async fn ensure_email_free(&self, email: &str) -> Result<(), AppError> {
        if self.repo.find_active_by_email(email).await?.is_some() {
            warn!(email, "email already registered");
            return Err(AppError::Conflict(
                conflict_message(UniqueField::Email).into(),
            ));
        }
        Ok(())
    }

    async fn ensure_username_free(&self, username: &str) -> Result<(), AppError> {
        if self.repo.find_active_by_username(username).await?.is_some() {
            warn!(username, "username already taken");
            return Err(AppError::Conflict(
                conflict_message(UniqueField::Username).into(),
            ));
        }
        Ok(())
    }

    async fn invalidate(&self, id: i64) {
        if let Err(e) = self.cache.delete(&user_cache_key(id)).await {
            warn!(user_id = id, error = %e, "cache invalidation failed");
        }
    }
}

async fn hash_blocking(plain: String) -> Result<String, AppError> {
    let hash = tokio::task::spawn_blocking(move || hash_password(&plain))
        .await
        .context("password hashing task failed")??;
    Ok(hash)
}
