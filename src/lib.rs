pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod content;
pub mod error;
pub mod github;
pub mod policy;
pub mod postgres_storage;
pub mod reclaimer;
pub mod service;
pub mod sqlite_storage;
pub mod storage;
