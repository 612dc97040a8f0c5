pub mod api;
pub mod auth;
pub mod codegen;
pub mod config;
pub mod journal;
pub mod models;
pub mod storage;
pub mod store;

pub use store::{BatchOutcome, CreateOutcome, RedirectStore, Resolution, StoreError, StoreOptions};
