//! Core types and traits for OOLA storage backends.
//!
//! This crate provides the `StorageBackend` trait and all associated types,
//! enabling pluggable storage implementations for stories, the checkout
//! ledger and contributor attribution.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    CheckoutEntry, CheckoutId, ContributorSummary, Genre, GenreId, Language, LanguageId, Ledger,
    Role, Story, StoryId, StoryStatus, StoryView, User, UserId,
};
pub use models::write::{NewLanguage, NewStory, NewUser};
pub use storage::{StorageBackend, StorageError};
