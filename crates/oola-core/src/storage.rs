use time::OffsetDateTime;

use crate::models::{
    write::{NewLanguage, NewStory, NewUser},
    CheckoutEntry, CheckoutId, ContributorSummary, Genre, GenreId, Language, LanguageId, Ledger,
    Story, StoryId, StoryStatus, User, UserId,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("story not found: {0}")]
    StoryNotFound(StoryId),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("user already exists: {0}")]
    UserAlreadyExists(String),
    #[error("language not found: {0}")]
    LanguageNotFound(LanguageId),
    #[error("genre not found: {0}")]
    GenreNotFound(GenreId),
    #[error("checkout not found: {0}")]
    CheckoutNotFound(CheckoutId),
    #[error("checkout {0} is already checked in")]
    CheckoutClosed(CheckoutId),
    #[error("story {story_id} is {actual}, expected {expected}")]
    StatusConflict {
        story_id: StoryId,
        expected: StoryStatus,
        actual: StoryStatus,
    },
}

/// Persistent store for stories, their checkout ledger and contributors.
///
/// Every method that changes a story's status does so as one atomic step:
/// the status compare-and-set and the matching ledger write either both
/// happen or neither does. Two callers racing on the same story are
/// serialized by the backend; the loser observes `StatusConflict`.
pub trait StorageBackend: Send + Sync {
    // Users
    fn create_user(&self, user: &NewUser) -> Result<User, StorageError>;
    fn get_user(&self, id: UserId) -> Result<User, StorageError>;
    fn find_user(&self, username: &str) -> Result<Option<User>, StorageError>;

    // Reference data
    fn upsert_language(&self, language: &NewLanguage) -> Result<Language, StorageError>;
    fn get_language(&self, id: LanguageId) -> Result<Language, StorageError>;
    fn list_languages(&self) -> Result<Vec<Language>, StorageError>;
    fn upsert_genre(&self, name: &str) -> Result<Genre, StorageError>;
    fn get_genre(&self, id: GenreId) -> Result<Genre, StorageError>;
    fn list_genres(&self) -> Result<Vec<Genre>, StorageError>;

    // Stories
    fn create_story(&self, story: &NewStory) -> Result<Story, StorageError>;
    fn get_story(&self, id: StoryId) -> Result<Story, StorageError>;
    fn list_stories(&self, status: Option<StoryStatus>) -> Result<Vec<Story>, StorageError>;
    fn set_story_file_path(&self, id: StoryId, path: &str) -> Result<(), StorageError>;
    /// Removes a story that never reached the content store. Stories with
    /// ledger entries are never deleted.
    fn delete_story(&self, id: StoryId) -> Result<(), StorageError>;
    /// Moves an available story to finished.
    fn finish_story(&self, id: StoryId) -> Result<Story, StorageError>;

    // Checkout ledger
    /// Flips `available -> checked_out` and appends an open entry.
    fn begin_checkout(
        &self,
        story_id: StoryId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> Result<CheckoutEntry, StorageError>;
    /// The open entry for a story, latest checkout first.
    fn open_checkout(&self, story_id: StoryId) -> Result<Option<CheckoutEntry>, StorageError>;
    /// Closes an open entry with the words contributed, adds them to the
    /// story total, sets the story to `next_status` and records the holder
    /// as a contributor (once).
    fn complete_checkin(
        &self,
        checkout_id: CheckoutId,
        at: OffsetDateTime,
        words_added: u64,
        next_status: StoryStatus,
    ) -> Result<CheckoutEntry, StorageError>;
    /// Open entries checked out strictly before `cutoff`.
    fn expired_checkouts(&self, cutoff: OffsetDateTime) -> Result<Vec<CheckoutEntry>, StorageError>;
    /// Force-closes an open entry without a contribution and makes the story
    /// available again. Returns `false` if the entry was already closed.
    fn reclaim_checkout(&self, checkout_id: CheckoutId, at: OffsetDateTime) -> Result<bool, StorageError>;
    fn ledger(&self, story_id: StoryId) -> Result<Ledger, StorageError>;

    // Contributors
    fn contributors(&self, story_id: StoryId) -> Result<Vec<ContributorSummary>, StorageError>;
}
