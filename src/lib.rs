pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod state;
pub mod users;

#[cfg(test)]
mod testing;
