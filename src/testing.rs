//! In-memory stand-ins for Postgres and Redis used by unit and HTTP tests.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use time::{macros::datetime, OffsetDateTime};

use crate::{
    cache::CacheStore,
    config::AppConfig,
    state::AppState,
    users::{
        repo::UserRepository,
        repo_types::{NewUser, RepoError, RepoResult, UniqueField, User},
    },
};

const EPOCH: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

pub fn sample_user(id: i64, is_superuser: bool) -> User {
    User {
        id,
        email: format!("user{id}@x.com"),
        username: format!("user{id}"),
        hashed_password: "$argon2id$placeholder".into(),
        is_active: true,
        is_superuser,
        is_email_verified: false,
        last_login: None,
        created_at: EPOCH,
        updated_at: EPOCH,
    }
}

#[derive(Default)]
struct Table {
    rows: Vec<User>,
    tick: i64,
}

impl Table {
    /// Strictly increasing timestamps keep `created_at DESC` deterministic.
    fn next_instant(&mut self) -> OffsetDateTime {
        self.tick += 1;
        EPOCH + time::Duration::seconds(self.tick)
    }

    fn conflict(&self, user_id: Option<i64>, email: &str, username: &str) -> Option<UniqueField> {
        let others = || {
            self.rows
                .iter()
                .filter(move |r| r.is_active && Some(r.id) != user_id)
        };
        if others().any(|r| r.email == email) {
            return Some(UniqueField::Email);
        }
        if others().any(|r| r.username == username) {
            return Some(UniqueField::Username);
        }
        None
    }
}

/// Mirrors the `users` table, including the active-scoped unique indexes.
#[derive(Default)]
pub struct InMemoryUserRepository {
    table: Mutex<Table>,
}

impl InMemoryUserRepository {
    /// Stored row regardless of `is_active`.
    pub fn raw(&self, id: i64) -> Option<User> {
        self.table
            .lock()
            .unwrap()
            .rows
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Direct write that bypasses the service and its cache handling.
    pub fn mutate(&self, id: i64, f: impl FnOnce(&mut User)) {
        let mut table = self.table.lock().unwrap();
        if let Some(row) = table.rows.iter_mut().find(|r| r.id == id) {
            f(row);
        }
    }

    fn with_active(&self, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.table
            .lock()
            .unwrap()
            .rows
            .iter()
            .find(|r| r.is_active && pred(r))
            .cloned()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: NewUser) -> RepoResult<User> {
        let mut table = self.table.lock().unwrap();
        if let Some(field) = table.conflict(None, &user.email, &user.username) {
            return Err(RepoError::UniqueViolation(field));
        }
        let now = table.next_instant();
        let row = User {
            id: table.rows.len() as i64 + 1,
            email: user.email,
            username: user.username,
            hashed_password: user.hashed_password,
            is_active: true,
            is_superuser: false,
            is_email_verified: false,
            last_login: None,
            created_at: now,
            updated_at: now,
        };
        table.rows.push(row.clone());
        Ok(row)
    }

    async fn find_active_by_id(&self, id: i64) -> RepoResult<Option<User>> {
        Ok(self.with_active(|r| r.id == id))
    }

    async fn find_active_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        Ok(self.with_active(|r| r.email == email))
    }

    async fn find_active_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        Ok(self.with_active(|r| r.username == username))
    }

    async fn list_active_paged(&self, limit: i64, offset: i64) -> RepoResult<(Vec<User>, i64)> {
        let table = self.table.lock().unwrap();
        let mut active: Vec<User> = table.rows.iter().filter(|r| r.is_active).cloned().collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = active.len() as i64;
        let page = active
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn update(&self, user: &User) -> RepoResult<Option<User>> {
        let mut table = self.table.lock().unwrap();
        if let Some(field) = table.conflict(Some(user.id), &user.email, &user.username) {
            return Err(RepoError::UniqueViolation(field));
        }
        let now = table.next_instant();
        let Some(row) = table
            .rows
            .iter_mut()
            .find(|r| r.id == user.id && r.is_active)
        else {
            return Ok(None);
        };
        row.email = user.email.clone();
        row.username = user.username.clone();
        row.hashed_password = user.hashed_password.clone();
        row.is_email_verified = user.is_email_verified;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn soft_delete(&self, id: i64) -> RepoResult<bool> {
        let mut table = self.table.lock().unwrap();
        let now = table.next_instant();
        match table.rows.iter_mut().find(|r| r.id == id && r.is_active) {
            Some(row) => {
                row.is_active = false;
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_last_login(&self, id: i64) -> RepoResult<bool> {
        let mut table = self.table.lock().unwrap();
        let now = table.next_instant();
        match table.rows.iter_mut().find(|r| r.id == id && r.is_active) {
            Some(row) => {
                row.last_login = Some(now);
                row.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// TTL-aware cache kept in a concurrent map.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.value().1 > Instant::now())
            .map(|e| e.value().0.clone());
        if hit.is_none() {
            self.entries.remove(key);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_by_pattern(&self, prefix: &str) -> anyhow::Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Every operation fails, as with an unreachable Redis.
pub struct FailingCache;

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        anyhow::bail!("cache unavailable")
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> anyhow::Result<()> {
        anyhow::bail!("cache unavailable")
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        anyhow::bail!("cache unavailable")
    }

    async fn delete_by_pattern(&self, _prefix: &str) -> anyhow::Result<u64> {
        anyhow::bail!("cache unavailable")
    }

    async fn ping(&self) -> anyhow::Result<()> {
        anyhow::bail!("cache unavailable")
    }
}

/// Application state over in-memory backends, with handles to both.
pub struct TestApp {
    pub state: AppState,
    pub repo: Arc<InMemoryUserRepository>,
    pub cache: Arc<MemoryCache>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(AppConfig::for_tests())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let repo = Arc::new(InMemoryUserRepository::default());
        let cache = Arc::new(MemoryCache::default());
        let state = AppState::from_parts(Arc::new(config), repo.clone(), cache.clone());
        Self { state, repo, cache }
    }

    /// Inserts an active user directly into the store.
    pub async fn insert_user(&self, email: &str, username: &str, is_superuser: bool) -> User {
        let user = self
            .repo
            .create(NewUser {
                email: email.into(),
                username: username.into(),
                hashed_password: sample_user(0, false).hashed_password,
            })
            .await
            .expect("insert test user");
        if is_superuser {
            self.repo.mutate(user.id, |u| u.is_superuser = true);
        }
        self.repo.raw(user.id).expect("inserted row")
    }

    /// `Authorization` header value carrying an access token for the stored user.
    pub fn bearer(&self, id: i64) -> String {
        let user = self.repo.raw(id).expect("user exists");
        let token = self.state.jwt.sign_access(&user).expect("sign access");
        format!("Bearer {token}")
    }
}
