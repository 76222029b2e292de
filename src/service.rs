//! Story workflow: creation, the checkout/checkin state machine and the
//! read-side queries that go with it.
//!
//! A story cycles `available -> checked_out -> available`. Checkout is a
//! storage-level compare-and-set. Checkin writes the merged text to the
//! content store first and only commits the ledger once that write has
//! succeeded, so the ledger never records a contribution the content store
//! does not hold.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use oola_core::{
    CheckoutEntry, CheckoutId, ContributorSummary, Genre, GenreId, Language, LanguageId, Ledger,
    NewLanguage, NewStory, NewUser, Role, Story, StoryId, StoryStatus, StoryView, User, UserId,
};

use crate::{
    clock::Clock,
    content::{append_contribution, format_story_header, story_filename, ContentError, ContentStore, StoryHeader},
    error::{ServiceError, ValidationError},
    policy::{count_words, CheckoutPolicy},
    storage::{run_blocking, StorageBackend, StorageError},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUser {
    pub username: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub pen_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStory {
    pub title: String,
    pub theme: String,
    #[serde(default)]
    pub initial_plot: Option<String>,
    pub language_id: LanguageId,
    pub genre_id: GenreId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutReceipt {
    pub checkout_id: CheckoutId,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_out_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinReceipt {
    pub checkout_id: CheckoutId,
    pub words_added: u64,
    pub status: StoryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStatus {
    pub checkout_id: CheckoutId,
    pub holder_id: UserId,
    pub checked_out_by: String,
    pub by_current_user: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_out_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

pub struct StoryService {
    storage: Arc<dyn StorageBackend>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    policy: CheckoutPolicy,
    checkins: CheckinLocks,
}

/// One async lock per story with a checkin in flight. A checkin holds it from
/// before the content read until the ledger commit, so a resubmission by the
/// same holder cannot append its text a second time.
#[derive(Default)]
struct CheckinLocks {
    locks: Mutex<HashMap<StoryId, Arc<AsyncMutex<()>>>>,
}

struct CheckinGuard<'a> {
    locks: &'a CheckinLocks,
    story_id: StoryId,
    _guard: OwnedMutexGuard<()>,
}

impl CheckinLocks {
    async fn acquire(&self, story_id: StoryId) -> CheckinGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(story_id).or_default().clone()
        };
        CheckinGuard {
            locks: self,
            story_id,
            _guard: lock.lock_owned().await,
        }
    }
}

impl Drop for CheckinGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this guard still reference the lock: nobody is waiting.
        if matches!(locks.get(&self.story_id), Some(lock) if Arc::strong_count(lock) == 2) {
            locks.remove(&self.story_id);
        }
    }
}

fn required(value: &str, field: &'static str) -> Result<Arc<str>, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(Arc::from(value))
}

fn optional(value: Option<&str>) -> Option<Arc<str>> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(Arc::from)
}

impl StoryService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
        policy: CheckoutPolicy,
    ) -> Self {
        Self {
            storage,
            content,
            clock,
            policy,
            checkins: CheckinLocks::default(),
        }
    }

    pub fn policy(&self) -> &CheckoutPolicy {
        &self.policy
    }

    async fn store<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StorageBackend) -> Result<T, StorageError> + Send + 'static,
    {
        run_blocking(&self.storage, f).await.map_err(ServiceError::from)
    }

    /// Awaits a content store call, bounded by the policy's remote timeout.
    async fn remote<T, F>(&self, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ContentError>>,
    {
        match tokio::time::timeout(self.policy.remote_timeout, call).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Upstream(format!(
                "content host did not respond within {:?}",
                self.policy.remote_timeout
            ))),
        }
    }

    /// Inserts the configured languages and genres, warning about languages
    /// whose container is missing on the content host.
    pub async fn seed_reference_data(
        &self,
        languages: Vec<NewLanguage>,
        genres: Vec<String>,
    ) -> Result<(), ServiceError> {
        for language in languages {
            let stored = self.store(move |s| s.upsert_language(&language)).await?;
            if !self.content.container_exists(&stored.container).await {
                tracing::warn!(
                    language = %stored.name,
                    container = %stored.container,
                    "Content container does not exist; story creation in this language will fail"
                );
            }
        }
        for genre in genres {
            self.store(move |s| s.upsert_genre(&genre)).await?;
        }
        Ok(())
    }

    pub async fn register_user(&self, request: RegisterUser) -> Result<User, ServiceError> {
        let user = NewUser {
            username: required(&request.username, "username")?,
            email: required(&request.email, "email")?,
            role: request.role,
            pen_name: optional(request.pen_name.as_deref()),
            created_at: self.clock.now(),
        };
        let user = self.store(move |s| s.create_user(&user)).await?;
        tracing::info!(user_id = user.id, username = %user.username, role = %user.role, "User registered");
        Ok(user)
    }

    pub async fn user_by_name(&self, username: &str) -> Result<User, ServiceError> {
        let name = username.to_string();
        self.store(move |s| s.find_user(&name))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user not found: {}", username)))
    }

    pub async fn languages(&self) -> Result<Vec<Language>, ServiceError> {
        self.store(|s| s.list_languages()).await
    }

    pub async fn genres(&self) -> Result<Vec<Genre>, ServiceError> {
        self.store(|s| s.list_genres()).await
    }

    /// Creates a story row and its initial document on the content host. If
    /// the content host refuses the document the row is removed again.
    pub async fn create_story(&self, creator_id: UserId, request: CreateStory) -> Result<Story, ServiceError> {
        let title = required(&request.title, "title")?;
        let theme = required(&request.theme, "theme")?;
        let initial_plot = optional(request.initial_plot.as_deref());
        let (language_id, genre_id) = (request.language_id, request.genre_id);

        let (creator, language, genre) = self
            .store(move |s| Ok((s.get_user(creator_id)?, s.get_language(language_id)?, s.get_genre(genre_id)?)))
            .await?;

        let new_story = NewStory {
            title,
            theme,
            initial_plot,
            language_id,
            genre_id,
            creator_id,
            created_at: self.clock.now(),
        };
        let mut story = self.store(move |s| s.create_story(&new_story)).await?;

        let filename = story_filename(story.id, &story.title);
        let document = format_story_header(&StoryHeader {
            title: &story.title,
            theme: &story.theme,
            initial_plot: story.initial_plot.as_deref(),
            genre: &genre.name,
            language: &language.name,
            creator: creator.display_name(),
        });
        let message = format!("Initial commit: {}", story.title);

        let created = self
            .remote(self.content.create(&language.container, &filename, &document, &message))
            .await;
        if let Err(e) = created {
            tracing::warn!(story_id = story.id, container = %language.container, error = %e, "Content file creation failed, removing story");
            let story_id = story.id;
            if let Err(rollback) = self.store(move |s| s.delete_story(story_id)).await {
                tracing::error!(story_id, error = %rollback, "Failed to remove story after content failure");
            }
            return Err(match e {
                ServiceError::Conflict(msg) => ServiceError::Upstream(msg),
                other => other,
            });
        }

        let (story_id, path) = (story.id, filename.clone());
        self.store(move |s| s.set_story_file_path(story_id, &path)).await?;
        story.file_path = Some(Arc::from(filename.as_str()));

        tracing::info!(story_id = story.id, creator_id, file = %filename, "Story created");
        Ok(story)
    }

    pub async fn get_story(&self, story_id: StoryId) -> Result<StoryView, ServiceError> {
        self.store(move |s| {
            let story = s.get_story(story_id)?;
            let language = s.get_language(story.language_id)?;
            let genre = s.get_genre(story.genre_id)?;
            let creator = s.get_user(story.creator_id)?;
            Ok(StoryView::new(story, &language, &genre, &creator))
        })
        .await
    }

    /// Stories with their language, genre and creator names joined in.
    pub async fn list_stories(&self, status: Option<StoryStatus>) -> Result<Vec<StoryView>, ServiceError> {
        self.store(move |s| {
            let stories = s.list_stories(status)?;
            let languages: HashMap<_, _> = s.list_languages()?.into_iter().map(|l| (l.id, l)).collect();
            let genres: HashMap<_, _> = s.list_genres()?.into_iter().map(|g| (g.id, g)).collect();
            let mut creators: HashMap<UserId, User> = HashMap::new();

            let mut views = Vec::with_capacity(stories.len());
            for story in stories {
                let language = languages.get(&story.language_id).ok_or(StorageError::LanguageNotFound(story.language_id))?;
                let genre = genres.get(&story.genre_id).ok_or(StorageError::GenreNotFound(story.genre_id))?;
                if !creators.contains_key(&story.creator_id) {
                    creators.insert(story.creator_id, s.get_user(story.creator_id)?);
                }
                let creator = &creators[&story.creator_id];
                views.push(StoryView::new(story, language, genre, creator));
            }
            Ok(views)
        })
        .await
    }

    /// Claims an available story for `user_id` until the checkout deadline.
    pub async fn checkout(&self, story_id: StoryId, user_id: UserId) -> Result<CheckoutReceipt, ServiceError> {
        let story = self.store(move |s| s.get_story(story_id)).await?;
        if story.status != StoryStatus::Available {
            return Err(ServiceError::InvalidState(format!(
                "story {} is {} and cannot be checked out",
                story_id, story.status
            )));
        }

        let user = self.store(move |s| s.get_user(user_id)).await?;
        if !user.role.can_author() {
            return Err(ServiceError::Forbidden(format!(
                "role {} cannot check out stories",
                user.role
            )));
        }

        let now = self.clock.now();
        let entry = self
            .store(move |s| s.begin_checkout(story_id, user_id, now))
            .await?;

        metrics::increment_counter!("oola_checkouts_total");
        let deadline = entry.deadline(self.policy.checkout_duration);
        tracing::info!(story_id, user_id, checkout_id = entry.id, %deadline, "Story checked out");

        Ok(CheckoutReceipt {
            checkout_id: entry.id,
            checked_out_at: entry.checked_out_at,
            deadline,
        })
    }

    /// Submits a contribution for the caller's open checkout.
    pub async fn checkin(&self, story_id: StoryId, user_id: UserId, text: &str) -> Result<CheckinReceipt, ServiceError> {
        let result = self.checkin_inner(story_id, user_id, text).await;
        if let Err(e) = &result {
            metrics::increment_counter!("oola_checkin_failures_total", "kind" => e.kind());
            tracing::warn!(story_id, user_id, kind = e.kind(), error = %e, "Checkin rejected");
        }
        result
    }

    async fn checkin_inner(&self, story_id: StoryId, user_id: UserId, text: &str) -> Result<CheckinReceipt, ServiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        // The holder's entry is looked up only once the lock is held, so a
        // checkin that waited here sees the entry its predecessor closed.
        let _guard = self.checkins.acquire(story_id).await;
        let (story, ledger) = self
            .store(move |s| Ok((s.get_story(story_id)?, s.ledger(story_id)?)))
            .await?;
        let entry = match holder_entry(&ledger, user_id) {
            Some(entry) => entry.clone(),
            None => {
                return Err(match ledger.open_entry() {
                    Some(_) => ServiceError::Forbidden(format!(
                        "story {} is checked out by another author",
                        story_id
                    )),
                    None => ServiceError::InvalidState(format!(
                        "story {} is not checked out by you",
                        story_id
                    )),
                })
            }
        };

        let count = count_words(text);
        if !self.policy.accepts(count) {
            return Err(ValidationError::WordCount {
                count,
                min: self.policy.min_words,
                max: self.policy.max_words,
            }
            .into());
        }

        let path = story
            .file_path
            .clone()
            .ok_or_else(|| ServiceError::NotFound(format!("story {} has no content file", story_id)))?;
        let language_id = story.language_id;
        let (language, author) = self
            .store(move |s| Ok((s.get_language(language_id)?, s.get_user(user_id)?)))
            .await?;

        let current = self
            .remote(self.content.read(&language.container, &path))
            .await
            .map_err(|e| match e {
                ServiceError::Conflict(msg) => ServiceError::Upstream(msg),
                other => other,
            })?;

        let now = self.clock.now();
        let author_name = author.display_name();
        let merged = append_contribution(&current.content, author_name, now, count, text);
        let message = format!("Contribution by {}: +{} words", author_name, count);
        self.remote(
            self.content
                .update(&language.container, &path, &merged, &message, current.token),
        )
        .await?;

        let words = count as u64;
        let next_status = if self.policy.finishes(story.word_count + words) {
            StoryStatus::Finished
        } else {
            StoryStatus::Available
        };
        let checkout_id = entry.id;
        let closed = match self
            .store(move |s| s.complete_checkin(checkout_id, now, words, next_status))
            .await
        {
            Ok(closed) => closed,
            Err(e) => {
                tracing::error!(
                    story_id,
                    checkout_id,
                    error = %e,
                    "Contribution was written to the content host but the checkout could not be closed"
                );
                return Err(e);
            }
        };

        metrics::increment_counter!("oola_checkins_total");
        metrics::counter!("oola_words_added_total", words);
        tracing::info!(story_id, user_id, checkout_id, words, status = %next_status, "Story checked in");

        Ok(CheckinReceipt {
            checkout_id: closed.id,
            words_added: closed.words_added,
            status: next_status,
        })
    }

    pub async fn checkout_status(
        &self,
        story_id: StoryId,
        viewer: Option<UserId>,
    ) -> Result<Option<CheckoutStatus>, ServiceError> {
        let open = self
            .store(move |s| {
                s.get_story(story_id)?;
                match s.open_checkout(story_id)? {
                    Some(entry) => {
                        let holder = s.get_user(entry.user_id)?;
                        Ok(Some((entry, holder)))
                    }
                    None => Ok(None),
                }
            })
            .await?;

        Ok(open.map(|(entry, holder)| CheckoutStatus {
            checkout_id: entry.id,
            holder_id: holder.id,
            checked_out_by: holder.display_name().to_string(),
            by_current_user: viewer == Some(holder.id),
            checked_out_at: entry.checked_out_at,
            expires_at: entry.deadline(self.policy.checkout_duration),
        }))
    }

    /// Full current text of a story as held by the content host.
    pub async fn story_content(&self, story_id: StoryId) -> Result<String, ServiceError> {
        let (story, language) = self
            .store(move |s| {
                let story = s.get_story(story_id)?;
                let language = s.get_language(story.language_id)?;
                Ok((story, language))
            })
            .await?;
        let path = story
            .file_path
            .ok_or_else(|| ServiceError::NotFound(format!("story {} has no content file", story_id)))?;
        let file = self.remote(self.content.read(&language.container, &path)).await?;
        Ok(file.content)
    }

    pub async fn contributors(&self, story_id: StoryId) -> Result<Vec<ContributorSummary>, ServiceError> {
        self.store(move |s| {
            s.get_story(story_id)?;
            s.contributors(story_id)
        })
        .await
    }

    pub async fn ledger(&self, story_id: StoryId) -> Result<Ledger, ServiceError> {
        self.store(move |s| s.ledger(story_id)).await
    }

    /// Closes a story for good. Only its creator may do so, and only while
    /// nobody holds it.
    pub async fn finish_story(&self, story_id: StoryId, user_id: UserId) -> Result<Story, ServiceError> {
        let story = self.store(move |s| s.get_story(story_id)).await?;
        if story.creator_id != user_id {
            return Err(ServiceError::Forbidden(format!(
                "only the creator may finish story {}",
                story_id
            )));
        }
        let story = self.store(move |s| s.finish_story(story_id)).await?;
        tracing::info!(story_id, user_id, "Story finished");
        Ok(story)
    }
}

/// The caller's own open entry; duplicates resolve to the latest checkout.
fn holder_entry(ledger: &Ledger, user_id: UserId) -> Option<&CheckoutEntry> {
    ledger
        .entries
        .iter()
        .filter(|e| e.is_open() && e.user_id == user_id)
        .max_by_key(|e| (e.checked_out_at, e.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, content::InMemoryContentStore, storage::InMemoryStorage};
    use time::macros::datetime;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    struct Fixture {
        service: StoryService,
        content: Arc<InMemoryContentStore>,
        clock: Arc<ManualClock>,
    }

    async fn seeded(content: Arc<dyn ContentStore>, clock: Arc<ManualClock>, policy: CheckoutPolicy) -> StoryService {
        let service = StoryService::new(Arc::new(InMemoryStorage::new()), content, clock, policy);
        service
            .seed_reference_data(
                vec![NewLanguage {
                    name: Arc::from("English"),
                    code: Arc::from("en"),
                    container: Arc::from("oola-stories-english"),
                }],
                vec!["Fantasy".to_string()],
            )
            .await
            .unwrap();
        service
    }

    async fn fixture() -> Fixture {
        let content = InMemoryContentStore::shared();
        content.add_container("oola-stories-english");
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 08:00 UTC)));
        let service = seeded(content.clone(), clock.clone(), CheckoutPolicy::default()).await;
        Fixture { service, content, clock }
    }

    /// Lets the first update land on the inner store, then holds it open
    /// until `release` is notified.
    struct PausingContent {
        inner: Arc<InMemoryContentStore>,
        paused: std::sync::atomic::AtomicBool,
        written: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ContentStore for PausingContent {
        async fn create(&self, container: &str, path: &str, content: &str, message: &str) -> Result<crate::content::VersionToken, ContentError> {
            self.inner.create(container, path, content, message).await
        }

        async fn read(&self, container: &str, path: &str) -> Result<crate::content::VersionedContent, ContentError> {
            self.inner.read(container, path).await
        }

        async fn update(
            &self,
            container: &str,
            path: &str,
            content: &str,
            message: &str,
            expected: crate::content::VersionToken,
        ) -> Result<crate::content::VersionToken, ContentError> {
            let token = self.inner.update(container, path, content, message, expected).await?;
            if !self.paused.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.written.notify_one();
                self.release.notified().await;
            }
            Ok(token)
        }

        async fn container_exists(&self, container: &str) -> bool {
            self.inner.container_exists(container).await
        }
    }

    async fn register(service: &StoryService, name: &str, role: Role) -> User {
        service
            .register_user(RegisterUser {
                username: name.to_string(),
                email: format!("{}@example.com", name),
                role,
                pen_name: None,
            })
            .await
            .unwrap()
    }

    async fn new_story(service: &StoryService, creator: UserId) -> Story {
        let language = service.languages().await.unwrap()[0].id;
        let genre = service.genres().await.unwrap()[0].id;
        service
            .create_story(
                creator,
                CreateStory {
                    title: "Salt Road".to_string(),
                    theme: "journeys".to_string(),
                    initial_plot: Some("A caravan sets out.".to_string()),
                    language_id: language,
                    genre_id: genre,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_story_writes_header() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let story = new_story(&f.service, author.id).await;

        let path = story.file_path.clone().unwrap();
        assert_eq!(path.as_ref(), format!("story-{}-salt-road.md", story.id));
        let doc = f.content.get("oola-stories-english", &path).unwrap();
        assert!(doc.starts_with("# Salt Road"));
        assert!(doc.contains("**Created by:** mira"));
    }

    #[tokio::test]
    async fn test_create_story_rolls_back_on_content_failure() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        f.content
            .fail_creates(Some(ContentError::Upstream("boom".to_string())));

        let language = f.service.languages().await.unwrap()[0].id;
        let genre = f.service.genres().await.unwrap()[0].id;
        let err = f
            .service
            .create_story(
                author.id,
                CreateStory {
                    title: "Lost".to_string(),
                    theme: "t".to_string(),
                    initial_plot: None,
                    language_id: language,
                    genre_id: genre,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert!(f.service.list_stories(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_story_requires_title() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let err = f
            .service
            .create_story(
                author.id,
                CreateStory {
                    title: "  ".to_string(),
                    theme: "t".to_string(),
                    initial_plot: None,
                    language_id: 1,
                    genre_id: 2,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::MissingField("title"))));
    }

    #[tokio::test]
    async fn test_checkout_requires_author_role() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let reader = register(&f.service, "rafi", Role::Reader).await;
        let story = new_story(&f.service, author.id).await;

        let err = f.service.checkout(story.id, reader.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert!(f.service.ledger(story.id).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_missing_story() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let err = f.service.checkout(999, author.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_checkout_sets_deadline() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let story = new_story(&f.service, author.id).await;

        let receipt = f.service.checkout(story.id, author.id).await.unwrap();
        assert_eq!(receipt.checked_out_at, datetime!(2024-06-01 08:00 UTC));
        assert_eq!(receipt.deadline, datetime!(2024-06-08 08:00 UTC));

        let status = f
            .service
            .checkout_status(story.id, Some(author.id))
            .await
            .unwrap()
            .unwrap();
        assert!(status.by_current_user);
        assert_eq!(status.checked_out_by, "mira");
        assert_eq!(status.expires_at, receipt.deadline);
    }

    #[tokio::test]
    async fn test_checkin_appends_attributed_section() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let story = new_story(&f.service, author.id).await;
        f.service.checkout(story.id, author.id).await.unwrap();
        f.clock.advance(time::Duration::days(2));

        let receipt = f
            .service
            .checkin(story.id, author.id, &format!("  {}  ", words(60)))
            .await
            .unwrap();
        assert_eq!(receipt.words_added, 60);
        assert_eq!(receipt.status, StoryStatus::Available);

        let doc = f.service.story_content(story.id).await.unwrap();
        assert!(doc.contains("### Contribution by mira (2024-06-03)\nWords: 60\n\nword word"));

        let story = f.service.get_story(story.id).await.unwrap().story;
        assert_eq!(story.word_count, 60);
        assert_eq!(story.status, StoryStatus::Available);
    }

    #[tokio::test]
    async fn test_checkin_by_other_author_is_forbidden() {
        let f = fixture().await;
        let holder = register(&f.service, "mira", Role::Author).await;
        let other = register(&f.service, "tomas", Role::Author).await;
        let story = new_story(&f.service, holder.id).await;
        f.service.checkout(story.id, holder.id).await.unwrap();

        let err = f.service.checkin(story.id, other.id, &words(100)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_checkin_without_checkout_is_invalid_state() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let story = new_story(&f.service, author.id).await;

        let err = f.service.checkin(story.id, author.id, &words(100)).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_empty_checkin_is_rejected_first() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let err = f.service.checkin(12345, author.id, " \n\t ").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::EmptyContent)));
    }

    #[tokio::test]
    async fn test_read_failure_leaves_checkout_open() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let story = new_story(&f.service, author.id).await;
        f.service.checkout(story.id, author.id).await.unwrap();
        f.content
            .fail_reads(Some(ContentError::Upstream("unreachable".to_string())));

        let err = f.service.checkin(story.id, author.id, &words(100)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        let story = f.service.get_story(story.id).await.unwrap().story;
        assert_eq!(story.status, StoryStatus::CheckedOut);
        assert_eq!(f.service.ledger(story.id).await.unwrap().open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_content_host_times_out_without_local_change() {
        let f = fixture().await;
        let author = register(&f.service, "mira", Role::Author).await;
        let story = new_story(&f.service, author.id).await;
        f.service.checkout(story.id, author.id).await.unwrap();
        f.content
            .set_latency(Some(f.service.policy().remote_timeout * 2));

        let err = f.service.checkin(story.id, author.id, &words(100)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(ref m) if m.contains("did not respond")));
        let story = f.service.get_story(story.id).await.unwrap().story;
        assert_eq!(story.status, StoryStatus::CheckedOut);
        assert_eq!(story.word_count, 0);
    }

    #[tokio::test]
    async fn test_resubmitted_checkin_waits_for_the_first() {
        let inner = InMemoryContentStore::shared();
        inner.add_container("oola-stories-english");
        let content = Arc::new(PausingContent {
            inner: inner.clone(),
            paused: std::sync::atomic::AtomicBool::new(false),
            written: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 08:00 UTC)));
        let service = Arc::new(seeded(content.clone(), clock, CheckoutPolicy::default()).await);
        let author = register(&service, "mira", Role::Author).await;
        let story = new_story(&service, author.id).await;
        service.checkout(story.id, author.id).await.unwrap();

        let (story_id, author_id) = (story.id, author.id);
        let submit = move |service: Arc<StoryService>| {
            tokio::spawn(async move { service.checkin(story_id, author_id, &words(60)).await })
        };
        let first = submit(service.clone());
        content.written.notified().await;
        let second = submit(service.clone());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        content.release.notify_one();

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.words_added, 60);
        let second = second.await.unwrap().unwrap_err();
        assert!(matches!(second, ServiceError::InvalidState(_)));

        let path = story.file_path.clone().unwrap();
        let doc = inner.get("oola-stories-english", &path).unwrap();
        assert_eq!(doc.matches("### Contribution by").count(), 1);
        let view = service.get_story(story.id).await.unwrap();
        assert_eq!(view.story.word_count, 60);
        assert_eq!(service.ledger(story.id).await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_story_views_carry_names() {
        let f = fixture().await;
        let author = f
            .service
            .register_user(RegisterUser {
                username: "mira".to_string(),
                email: "mira@example.com".to_string(),
                role: Role::Author,
                pen_name: Some("M. Okafor".to_string()),
            })
            .await
            .unwrap();
        let story = new_story(&f.service, author.id).await;

        let view = f.service.get_story(story.id).await.unwrap();
        assert_eq!(view.story, story);
        assert_eq!(view.language_name.as_ref(), "English");
        assert_eq!(view.container.as_ref(), "oola-stories-english");
        assert_eq!(view.genre_name.as_ref(), "Fantasy");
        assert_eq!(view.creator_name.as_ref(), "mira");
        assert_eq!(view.creator_pen_name.as_deref(), Some("M. Okafor"));

        let listed = f.service.list_stories(Some(StoryStatus::Available)).await.unwrap();
        assert_eq!(listed, vec![view]);
        assert!(f.service.list_stories(Some(StoryStatus::Finished)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_threshold_closes_story() {
        let content = InMemoryContentStore::shared();
        let policy = CheckoutPolicy {
            finish_at_words: Some(100),
            ..CheckoutPolicy::default()
        };
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 08:00 UTC)));
        let service = seeded(content, clock, policy).await;
        let author = register(&service, "mira", Role::Author).await;
        let story = new_story(&service, author.id).await;

        service.checkout(story.id, author.id).await.unwrap();
        let first = service.checkin(story.id, author.id, &words(60)).await.unwrap();
        assert_eq!(first.status, StoryStatus::Available);

        service.checkout(story.id, author.id).await.unwrap();
        let second = service.checkin(story.id, author.id, &words(60)).await.unwrap();
        assert_eq!(second.status, StoryStatus::Finished);

        let err = service.checkout(story.id, author.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_only_creator_finishes_story() {
        let f = fixture().await;
        let creator = register(&f.service, "mira", Role::Author).await;
        let other = register(&f.service, "tomas", Role::Author).await;
        let story = new_story(&f.service, creator.id).await;

        let err = f.service.finish_story(story.id, other.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        f.service.checkout(story.id, creator.id).await.unwrap();
        let err = f.service.finish_story(story.id, creator.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        f.service.checkin(story.id, creator.id, &words(55)).await.unwrap();
        let finished = f.service.finish_story(story.id, creator.id).await.unwrap();
        assert_eq!(finished.status, StoryStatus::Finished);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_invalid_state() {
        let f = fixture().await;
        register(&f.service, "mira", Role::Author).await;
        let err = f
            .service
            .register_user(RegisterUser {
                username: "mira".to_string(),
                email: "other@example.com".to_string(),
                role: Role::Reader,
                pen_name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }
}
