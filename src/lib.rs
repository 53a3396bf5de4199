pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod event;
pub mod handlers;
pub mod input;
pub mod metrics;
pub mod middleware;
pub mod permission;
pub mod proxy;
pub mod router;
pub mod services;
pub mod state;
pub mod storage;
pub mod stream;
pub mod tracker;

pub use router::app;
pub use state::AppState;
