use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use time::OffsetDateTime;

use oola_core::{
    CheckoutEntry, CheckoutId, ContributorSummary, Genre, GenreId, Language, LanguageId, Ledger,
    NewLanguage, NewStory, NewUser, Story, StoryId, StoryStatus, User, UserId,
};

// Re-export core storage types so callers can use crate::storage::*
pub use oola_core::storage::{StorageBackend, StorageError};

/// Runs a synchronous storage call on the blocking pool so that database
/// drivers never block a runtime worker.
pub async fn run_blocking<T, F>(storage: &Arc<dyn StorageBackend>, f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StorageBackend) -> Result<T, StorageError> + Send + 'static,
{
    let storage = Arc::clone(storage);
    tokio::task::spawn_blocking(move || f(storage.as_ref()))
        .await
        .map_err(|e| StorageError::Other(format!("storage task failed: {}", e)))?
}

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<UserId, User>,
    languages: BTreeMap<LanguageId, Language>,
    genres: BTreeMap<GenreId, Genre>,
    stories: BTreeMap<StoryId, Story>,
    checkouts: BTreeMap<CheckoutId, CheckoutEntry>,
    contributors: BTreeMap<(StoryId, UserId), OffsetDateTime>,
    last_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn story_mut(&mut self, id: StoryId) -> Result<&mut Story, StorageError> {
        self.stories.get_mut(&id).ok_or(StorageError::StoryNotFound(id))
    }
}

/// Storage backend holding everything behind one lock. Each status
/// transition takes the write lock for its whole duration, which serializes
/// conflicting transitions.
pub struct InMemoryStorage {
    state: RwLock<MemoryState>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Other("storage lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Other("storage lock poisoned".to_string()))
    }
}

impl StorageBackend for InMemoryStorage {
    fn create_user(&self, user: &NewUser) -> Result<User, StorageError> {
        let mut state = self.write()?;
        let taken = state
            .users
            .values()
            .any(|u| u.username == user.username || u.email == user.email);
        if taken {
            return Err(StorageError::UserAlreadyExists(user.username.to_string()));
        }
        let id = state.next_id();
        let created = User {
            id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            pen_name: user.pen_name.clone(),
            created_at: user.created_at,
        };
        state.users.insert(id, created.clone());
        Ok(created)
    }

    fn get_user(&self, id: UserId) -> Result<User, StorageError> {
        self.read()?
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::UserNotFound(id.to_string()))
    }

    fn find_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.username.as_ref() == username)
            .cloned())
    }

    fn upsert_language(&self, language: &NewLanguage) -> Result<Language, StorageError> {
        let mut state = self.write()?;
        let existing = state
            .languages
            .values()
            .find(|l| l.code == language.code)
            .map(|l| l.id);
        let id = match existing {
            Some(id) => id,
            None => state.next_id(),
        };
        let stored = Language {
            id,
            name: language.name.clone(),
            code: language.code.clone(),
            container: language.container.clone(),
        };
        state.languages.insert(id, stored.clone());
        Ok(stored)
    }

    fn get_language(&self, id: LanguageId) -> Result<Language, StorageError> {
        self.read()?
            .languages
            .get(&id)
            .cloned()
            .ok_or(StorageError::LanguageNotFound(id))
    }

    fn list_languages(&self) -> Result<Vec<Language>, StorageError> {
        Ok(self.read()?.languages.values().cloned().collect())
    }

    fn upsert_genre(&self, name: &str) -> Result<Genre, StorageError> {
        let mut state = self.write()?;
        if let Some(genre) = state.genres.values().find(|g| g.name.as_ref() == name) {
            return Ok(genre.clone());
        }
        let id = state.next_id();
        let genre = Genre {
            id,
            name: Arc::from(name),
        };
        state.genres.insert(id, genre.clone());
        Ok(genre)
    }

    fn get_genre(&self, id: GenreId) -> Result<Genre, StorageError> {
        self.read()?
            .genres
            .get(&id)
            .cloned()
            .ok_or(StorageError::GenreNotFound(id))
    }

    fn list_genres(&self) -> Result<Vec<Genre>, StorageError> {
        Ok(self.read()?.genres.values().cloned().collect())
    }

    fn create_story(&self, story: &NewStory) -> Result<Story, StorageError> {
        let mut state = self.write()?;
        if !state.languages.contains_key(&story.language_id) {
            return Err(StorageError::LanguageNotFound(story.language_id));
        }
        if !state.genres.contains_key(&story.genre_id) {
            return Err(StorageError::GenreNotFound(story.genre_id));
        }
        if !state.users.contains_key(&story.creator_id) {
            return Err(StorageError::UserNotFound(story.creator_id.to_string()));
        }
        let id = state.next_id();
        let created = Story {
            id,
            title: story.title.clone(),
            theme: story.theme.clone(),
            initial_plot: story.initial_plot.clone(),
            language_id: story.language_id,
            genre_id: story.genre_id,
            creator_id: story.creator_id,
            file_path: None,
            status: StoryStatus::Available,
            word_count: 0,
            created_at: story.created_at,
        };
        state.stories.insert(id, created.clone());
        Ok(created)
    }

    fn get_story(&self, id: StoryId) -> Result<Story, StorageError> {
        self.read()?
            .stories
            .get(&id)
            .cloned()
            .ok_or(StorageError::StoryNotFound(id))
    }

    fn list_stories(&self, status: Option<StoryStatus>) -> Result<Vec<Story>, StorageError> {
        Ok(self
            .read()?
            .stories
            .values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect())
    }

    fn set_story_file_path(&self, id: StoryId, path: &str) -> Result<(), StorageError> {
        let mut state = self.write()?;
        state.story_mut(id)?.file_path = Some(Arc::from(path));
        Ok(())
    }

    fn delete_story(&self, id: StoryId) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.checkouts.values().any(|c| c.story_id == id) {
            return Err(StorageError::Other(format!(
                "story {} has ledger entries and cannot be deleted",
                id
            )));
        }
        state
            .stories
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::StoryNotFound(id))
    }

    fn finish_story(&self, id: StoryId) -> Result<Story, StorageError> {
        let mut state = self.write()?;
        let story = state.story_mut(id)?;
        if story.status != StoryStatus::Available {
            return Err(StorageError::StatusConflict {
                story_id: id,
                expected: StoryStatus::Available,
                actual: story.status,
            });
        }
        story.status = StoryStatus::Finished;
        Ok(story.clone())
    }

    fn begin_checkout(
        &self,
        story_id: StoryId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> Result<CheckoutEntry, StorageError> {
        let mut state = self.write()?;
        if !state.users.contains_key(&user_id) {
            return Err(StorageError::UserNotFound(user_id.to_string()));
        }
        let story = state.story_mut(story_id)?;
        if story.status != StoryStatus::Available {
            return Err(StorageError::StatusConflict {
                story_id,
                expected: StoryStatus::Available,
                actual: story.status,
            });
        }
        story.status = StoryStatus::CheckedOut;

        let id = state.next_id();
        let entry = CheckoutEntry {
            id,
            story_id,
            user_id,
            checked_out_at: at,
            checked_in_at: None,
            auto_checkin: false,
            words_added: 0,
        };
        state.checkouts.insert(id, entry.clone());
        tracing::debug!(story_id, user_id, checkout_id = id, "In-memory checkout opened");
        Ok(entry)
    }

    fn open_checkout(&self, story_id: StoryId) -> Result<Option<CheckoutEntry>, StorageError> {
        Ok(self
            .read()?
            .checkouts
            .values()
            .filter(|c| c.story_id == story_id && c.is_open())
            .max_by_key(|c| (c.checked_out_at, c.id))
            .cloned())
    }

    fn complete_checkin(
        &self,
        checkout_id: CheckoutId,
        at: OffsetDateTime,
        words_added: u64,
        next_status: StoryStatus,
    ) -> Result<CheckoutEntry, StorageError> {
        let mut state = self.write()?;
        let entry = state
            .checkouts
            .get(&checkout_id)
            .cloned()
            .ok_or(StorageError::CheckoutNotFound(checkout_id))?;
        if !entry.is_open() {
            return Err(StorageError::CheckoutClosed(checkout_id));
        }

        // The story must still be held by this entry.
        let story = state.story_mut(entry.story_id)?;
        if story.status != StoryStatus::CheckedOut {
            return Err(StorageError::StatusConflict {
                story_id: entry.story_id,
                expected: StoryStatus::CheckedOut,
                actual: story.status,
            });
        }
        story.status = next_status;
        story.word_count += words_added;

        let closed = CheckoutEntry {
            checked_in_at: Some(at),
            words_added,
            ..entry
        };
        state.checkouts.insert(checkout_id, closed.clone());
        state
            .contributors
            .entry((closed.story_id, closed.user_id))
            .or_insert(at);
        Ok(closed)
    }

    fn expired_checkouts(&self, cutoff: OffsetDateTime) -> Result<Vec<CheckoutEntry>, StorageError> {
        Ok(self
            .read()?
            .checkouts
            .values()
            .filter(|c| c.is_open() && c.checked_out_at < cutoff)
            .cloned()
            .collect())
    }

    fn reclaim_checkout(&self, checkout_id: CheckoutId, at: OffsetDateTime) -> Result<bool, StorageError> {
        let mut state = self.write()?;
        let entry = state
            .checkouts
            .get(&checkout_id)
            .cloned()
            .ok_or(StorageError::CheckoutNotFound(checkout_id))?;
        if !entry.is_open() {
            return Ok(false);
        }

        let story = state.story_mut(entry.story_id)?;
        if story.status == StoryStatus::CheckedOut {
            story.status = StoryStatus::Available;
        }
        state.checkouts.insert(
            checkout_id,
            CheckoutEntry {
                checked_in_at: Some(at),
                auto_checkin: true,
                words_added: 0,
                ..entry
            },
        );
        Ok(true)
    }

    fn ledger(&self, story_id: StoryId) -> Result<Ledger, StorageError> {
        let state = self.read()?;
        if !state.stories.contains_key(&story_id) {
            return Err(StorageError::StoryNotFound(story_id));
        }
        let mut entries: Vec<CheckoutEntry> = state
            .checkouts
            .values()
            .filter(|c| c.story_id == story_id)
            .cloned()
            .collect();
        entries.sort_by_key(|c| (c.checked_out_at, c.id));
        Ok(Ledger { story_id, entries })
    }

    fn contributors(&self, story_id: StoryId) -> Result<Vec<ContributorSummary>, StorageError> {
        let state = self.read()?;
        let mut result = Vec::new();
        let keys = (story_id, UserId::MIN)..=(story_id, UserId::MAX);
        for (&(sid, user_id), &contributed_at) in state.contributors.range(keys) {
            let user = state
                .users
                .get(&user_id)
                .ok_or_else(|| StorageError::UserNotFound(user_id.to_string()))?;
            let total_words = state
                .checkouts
                .values()
                .filter(|c| c.story_id == sid && c.user_id == user_id)
                .map(|c| c.words_added)
                .sum();
            result.push(ContributorSummary {
                user_id,
                username: user.username.clone(),
                pen_name: user.pen_name.clone(),
                contributed_at,
                total_words,
            });
        }
        result.sort_by_key(|c| (c.contributed_at, c.user_id));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oola_core::Role;
    use time::{macros::datetime, Duration};

    fn seeded() -> (InMemoryStorage, StoryId, UserId) {
        let storage = InMemoryStorage::new();
        let at = datetime!(2024-03-01 09:00 UTC);
        let user = storage
            .create_user(&NewUser {
                username: Arc::from("asha"),
                email: Arc::from("asha@example.com"),
                role: Role::Author,
                pen_name: None,
                created_at: at,
            })
            .unwrap();
        let language = storage
            .upsert_language(&NewLanguage {
                name: Arc::from("English"),
                code: Arc::from("en"),
                container: Arc::from("oola-stories-english"),
            })
            .unwrap();
        let genre = storage.upsert_genre("Mystery").unwrap();
        let story = storage
            .create_story(&NewStory {
                title: Arc::from("The Lantern"),
                theme: Arc::from("light"),
                initial_plot: None,
                language_id: language.id,
                genre_id: genre.id,
                creator_id: user.id,
                created_at: at,
            })
            .unwrap();
        (storage, story.id, user.id)
    }

    #[test]
    fn test_checkout_is_compare_and_set() {
        let (storage, story_id, user_id) = seeded();
        let at = datetime!(2024-03-02 10:00 UTC);

        storage.begin_checkout(story_id, user_id, at).unwrap();
        let second = storage.begin_checkout(story_id, user_id, at);
        assert!(matches!(
            second,
            Err(StorageError::StatusConflict { actual: StoryStatus::CheckedOut, .. })
        ));
        assert_eq!(storage.ledger(story_id).unwrap().entries.len(), 1);
    }

    #[test]
    fn test_complete_checkin_updates_story_and_contributors() {
        let (storage, story_id, user_id) = seeded();
        let at = datetime!(2024-03-02 10:00 UTC);

        let entry = storage.begin_checkout(story_id, user_id, at).unwrap();
        storage
            .complete_checkin(entry.id, at + Duration::hours(2), 120, StoryStatus::Available)
            .unwrap();

        let story = storage.get_story(story_id).unwrap();
        assert_eq!(story.status, StoryStatus::Available);
        assert_eq!(story.word_count, 120);
        assert!(storage.open_checkout(story_id).unwrap().is_none());

        let again = storage.complete_checkin(entry.id, at, 5, StoryStatus::Available);
        assert!(matches!(again, Err(StorageError::CheckoutClosed(_))));

        let contributors = storage.contributors(story_id).unwrap();
        assert_eq!(contributors.len(), 1);
        assert_eq!(contributors[0].total_words, 120);
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let (storage, story_id, user_id) = seeded();
        let at = datetime!(2024-03-02 10:00 UTC);
        let entry = storage.begin_checkout(story_id, user_id, at).unwrap();

        assert!(storage.reclaim_checkout(entry.id, at + Duration::days(8)).unwrap());
        assert!(!storage.reclaim_checkout(entry.id, at + Duration::days(9)).unwrap());

        let ledger = storage.ledger(story_id).unwrap();
        assert!(ledger.entries[0].auto_checkin);
        assert_eq!(ledger.entries[0].checked_in_at, Some(at + Duration::days(8)));
        assert_eq!(storage.get_story(story_id).unwrap().status, StoryStatus::Available);
    }

    #[test]
    fn test_delete_refuses_stories_with_history() {
        let (storage, story_id, user_id) = seeded();
        storage
            .begin_checkout(story_id, user_id, datetime!(2024-03-02 10:00 UTC))
            .unwrap();
        assert!(storage.delete_story(story_id).is_err());
        assert!(storage.get_story(story_id).is_ok());
    }
}
