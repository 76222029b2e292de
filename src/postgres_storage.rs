use std::sync::{Arc, Mutex, MutexGuard};

use postgres::{error::SqlState, Client, GenericClient, NoTls, Row};
use time::OffsetDateTime;

use oola_core::{
    CheckoutEntry, CheckoutId, ContributorSummary, Genre, GenreId, Language, LanguageId, Ledger,
    NewLanguage, NewStory, NewUser, Role, Story, StoryId, StoryStatus, User, UserId,
};

use crate::storage::{StorageBackend, StorageError};

const USER_COLUMNS: &str = "id, username, email, role, pen_name, created_at";
const STORY_COLUMNS: &str =
    "id, title, theme, initial_plot, language_id, genre_id, creator_id, file_path, status, word_count, created_at";
const CHECKOUT_COLUMNS: &str =
    "id, story_id, user_id, checked_out_at, checked_in_at, auto_checkin, words_added";

pub struct PostgresStorage {
    client: Mutex<Client>,
}

fn pg_err(e: postgres::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn ts(secs: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| StorageError::Other(format!("invalid timestamp {}: {}", secs, e)))
}

fn arc(row: &Row, idx: usize) -> Arc<str> {
    Arc::from(row.get::<_, String>(idx))
}

fn arc_opt(row: &Row, idx: usize) -> Option<Arc<str>> {
    row.get::<_, Option<String>>(idx).map(Arc::from)
}

fn user_from_row(row: &Row) -> Result<User, StorageError> {
    Ok(User {
        id: row.get(0),
        username: arc(row, 1),
        email: arc(row, 2),
        role: row.get::<_, String>(3).parse::<Role>().map_err(StorageError::Other)?,
        pen_name: arc_opt(row, 4),
        created_at: ts(row.get(5))?,
    })
}

fn story_from_row(row: &Row) -> Result<Story, StorageError> {
    Ok(Story {
        id: row.get(0),
        title: arc(row, 1),
        theme: arc(row, 2),
        initial_plot: arc_opt(row, 3),
        language_id: row.get(4),
        genre_id: row.get(5),
        creator_id: row.get(6),
        file_path: arc_opt(row, 7),
        status: row
            .get::<_, String>(8)
            .parse::<StoryStatus>()
            .map_err(StorageError::Other)?,
        word_count: row.get::<_, i64>(9) as u64,
        created_at: ts(row.get(10))?,
    })
}

fn checkout_from_row(row: &Row) -> Result<CheckoutEntry, StorageError> {
    Ok(CheckoutEntry {
        id: row.get(0),
        story_id: row.get(1),
        user_id: row.get(2),
        checked_out_at: ts(row.get(3))?,
        checked_in_at: row.get::<_, Option<i64>>(4).map(ts).transpose()?,
        auto_checkin: row.get(5),
        words_added: row.get::<_, i64>(6) as u64,
    })
}

fn language_from_row(row: &Row) -> Language {
    Language {
        id: row.get(0),
        name: arc(row, 1),
        code: arc(row, 2),
        container: arc(row, 3),
    }
}

fn genre_from_row(row: &Row) -> Genre {
    Genre {
        id: row.get(0),
        name: arc(row, 1),
    }
}

fn load_story<C: GenericClient>(client: &mut C, id: StoryId) -> Result<Story, StorageError> {
    let row = client
        .query_opt(
            format!("SELECT {} FROM stories WHERE id = $1", STORY_COLUMNS).as_str(),
            &[&id],
        )
        .map_err(pg_err)?
        .ok_or(StorageError::StoryNotFound(id))?;
    story_from_row(&row)
}

fn load_checkout<C: GenericClient>(client: &mut C, id: CheckoutId) -> Result<CheckoutEntry, StorageError> {
    let row = client
        .query_opt(
            format!("SELECT {} FROM checkout_log WHERE id = $1", CHECKOUT_COLUMNS).as_str(),
            &[&id],
        )
        .map_err(pg_err)?
        .ok_or(StorageError::CheckoutNotFound(id))?;
    checkout_from_row(&row)
}

fn status_conflict<C: GenericClient>(client: &mut C, story_id: StoryId, expected: StoryStatus) -> StorageError {
    match load_story(client, story_id) {
        Ok(story) => StorageError::StatusConflict {
            story_id,
            expected,
            actual: story.status,
        },
        Err(e) => e,
    }
}

fn exists<C: GenericClient>(client: &mut C, table: &str, id: i64) -> Result<bool, StorageError> {
    let row = client
        .query_one(
            format!("SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1)", table).as_str(),
            &[&id],
        )
        .map_err(pg_err)?;
    Ok(row.get(0))
}

impl PostgresStorage {
    /// Connects with the blocking client. Must be called outside of a tokio
    /// runtime.
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::connect(connection_string, NoTls)
            .map_err(|e| StorageError::Other(format!("PostgreSQL connection failed: {}", e)))?;

        let storage = Self {
            client: Mutex::new(client),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn client(&self) -> Result<MutexGuard<'_, Client>, StorageError> {
        self.client
            .lock()
            .map_err(|_| StorageError::Other("postgres client lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut client = self.client()?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                pen_name TEXT,
                created_at BIGINT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS languages (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                code TEXT NOT NULL UNIQUE,
                container TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS genres (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS stories (
                id BIGSERIAL PRIMARY KEY,
                title TEXT NOT NULL,
                theme TEXT NOT NULL,
                initial_plot TEXT,
                language_id BIGINT NOT NULL REFERENCES languages(id),
                genre_id BIGINT NOT NULL REFERENCES genres(id),
                creator_id BIGINT NOT NULL REFERENCES users(id),
                file_path TEXT,
                status TEXT NOT NULL DEFAULT 'available',
                word_count BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS story_contributors (
                id BIGSERIAL PRIMARY KEY,
                story_id BIGINT NOT NULL REFERENCES stories(id),
                user_id BIGINT NOT NULL REFERENCES users(id),
                contributed_at BIGINT NOT NULL,
                UNIQUE (story_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS checkout_log (
                id BIGSERIAL PRIMARY KEY,
                story_id BIGINT NOT NULL REFERENCES stories(id),
                user_id BIGINT NOT NULL REFERENCES users(id),
                checked_out_at BIGINT NOT NULL,
                checked_in_at BIGINT,
                auto_checkin BOOLEAN NOT NULL DEFAULT FALSE,
                words_added BIGINT NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_checkout_open
                ON checkout_log(story_id) WHERE checked_in_at IS NULL;

            CREATE INDEX IF NOT EXISTS idx_checkout_story
                ON checkout_log(story_id, checked_out_at);

            CREATE INDEX IF NOT EXISTS idx_stories_status
                ON stories(status);
            ",
            )
            .map_err(pg_err)?;
        Ok(())
    }
}

impl StorageBackend for PostgresStorage {
    fn create_user(&self, user: &NewUser) -> Result<User, StorageError> {
        let mut client = self.client()?;
        let row = client
            .query_one(
                format!(
                    "INSERT INTO users (username, email, role, pen_name, created_at)
                     VALUES ($1, $2, $3, $4, $5) RETURNING {}",
                    USER_COLUMNS
                )
                .as_str(),
                &[
                    &user.username.as_ref(),
                    &user.email.as_ref(),
                    &user.role.as_str(),
                    &user.pen_name.as_deref(),
                    &user.created_at.unix_timestamp(),
                ],
            )
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    StorageError::UserAlreadyExists(user.username.to_string())
                } else {
                    pg_err(e)
                }
            })?;
        user_from_row(&row)
    }

    fn get_user(&self, id: UserId) -> Result<User, StorageError> {
        let mut client = self.client()?;
        let row = client
            .query_opt(
                format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS).as_str(),
                &[&id],
            )
            .map_err(pg_err)?
            .ok_or_else(|| StorageError::UserNotFound(id.to_string()))?;
        user_from_row(&row)
    }

    fn find_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        let mut client = self.client()?;
        client
            .query_opt(
                format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS).as_str(),
                &[&username],
            )
            .map_err(pg_err)?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    fn upsert_language(&self, language: &NewLanguage) -> Result<Language, StorageError> {
        let mut client = self.client()?;
        let row = client
            .query_one(
                "INSERT INTO languages (name, code, container) VALUES ($1, $2, $3)
                 ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name, container = EXCLUDED.container
                 RETURNING id, name, code, container",
                &[
                    &language.name.as_ref(),
                    &language.code.as_ref(),
                    &language.container.as_ref(),
                ],
            )
            .map_err(pg_err)?;
        Ok(language_from_row(&row))
    }

    fn get_language(&self, id: LanguageId) -> Result<Language, StorageError> {
        let mut client = self.client()?;
        client
            .query_opt("SELECT id, name, code, container FROM languages WHERE id = $1", &[&id])
            .map_err(pg_err)?
            .map(|row| language_from_row(&row))
            .ok_or(StorageError::LanguageNotFound(id))
    }

    fn list_languages(&self) -> Result<Vec<Language>, StorageError> {
        let mut client = self.client()?;
        let rows = client
            .query("SELECT id, name, code, container FROM languages ORDER BY id", &[])
            .map_err(pg_err)?;
        Ok(rows.iter().map(language_from_row).collect())
    }

    fn upsert_genre(&self, name: &str) -> Result<Genre, StorageError> {
        let mut client = self.client()?;
        let row = client
            .query_one(
                "INSERT INTO genres (name) VALUES ($1)
                 ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                 RETURNING id, name",
                &[&name],
            )
            .map_err(pg_err)?;
        Ok(genre_from_row(&row))
    }

    fn get_genre(&self, id: GenreId) -> Result<Genre, StorageError> {
        let mut client = self.client()?;
        client
            .query_opt("SELECT id, name FROM genres WHERE id = $1", &[&id])
            .map_err(pg_err)?
            .map(|row| genre_from_row(&row))
            .ok_or(StorageError::GenreNotFound(id))
    }

    fn list_genres(&self) -> Result<Vec<Genre>, StorageError> {
        let mut client = self.client()?;
        let rows = client
            .query("SELECT id, name FROM genres ORDER BY id", &[])
            .map_err(pg_err)?;
        Ok(rows.iter().map(genre_from_row).collect())
    }

    fn create_story(&self, story: &NewStory) -> Result<Story, StorageError> {
        let mut client = self.client()?;
        if !exists(&mut *client, "languages", story.language_id)? {
            return Err(StorageError::LanguageNotFound(story.language_id));
        }
        if !exists(&mut *client, "genres", story.genre_id)? {
            return Err(StorageError::GenreNotFound(story.genre_id));
        }
        if !exists(&mut *client, "users", story.creator_id)? {
            return Err(StorageError::UserNotFound(story.creator_id.to_string()));
        }
        let row = client
            .query_one(
                format!(
                    "INSERT INTO stories (title, theme, initial_plot, language_id, genre_id, creator_id, status, word_count, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, 'available', 0, $7) RETURNING {}",
                    STORY_COLUMNS
                )
                .as_str(),
                &[
                    &story.title.as_ref(),
                    &story.theme.as_ref(),
                    &story.initial_plot.as_deref(),
                    &story.language_id,
                    &story.genre_id,
                    &story.creator_id,
                    &story.created_at.unix_timestamp(),
                ],
            )
            .map_err(pg_err)?;
        story_from_row(&row)
    }

    fn get_story(&self, id: StoryId) -> Result<Story, StorageError> {
        let mut client = self.client()?;
        load_story(&mut *client, id)
    }

    fn list_stories(&self, status: Option<StoryStatus>) -> Result<Vec<Story>, StorageError> {
        let mut client = self.client()?;
        let status = status.map(|s| s.as_str());
        let rows = client
            .query(
                format!(
                    "SELECT {} FROM stories WHERE $1::TEXT IS NULL OR status = $1 ORDER BY id",
                    STORY_COLUMNS
                )
                .as_str(),
                &[&status],
            )
            .map_err(pg_err)?;
        rows.iter().map(story_from_row).collect()
    }

    fn set_story_file_path(&self, id: StoryId, path: &str) -> Result<(), StorageError> {
        let mut client = self.client()?;
        let changed = client
            .execute("UPDATE stories SET file_path = $2 WHERE id = $1", &[&id, &path])
            .map_err(pg_err)?;
        if changed == 0 {
            return Err(StorageError::StoryNotFound(id));
        }
        Ok(())
    }

    fn delete_story(&self, id: StoryId) -> Result<(), StorageError> {
        let mut client = self.client()?;
        let history: i64 = client
            .query_one("SELECT COUNT(*) FROM checkout_log WHERE story_id = $1", &[&id])
            .map_err(pg_err)?
            .get(0);
        if history > 0 {
            return Err(StorageError::Other(format!(
                "story {} has ledger entries and cannot be deleted",
                id
            )));
        }
        let changed = client
            .execute("DELETE FROM stories WHERE id = $1", &[&id])
            .map_err(pg_err)?;
        if changed == 0 {
            return Err(StorageError::StoryNotFound(id));
        }
        Ok(())
    }

    fn finish_story(&self, id: StoryId) -> Result<Story, StorageError> {
        let mut client = self.client()?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE stories SET status = 'finished' WHERE id = $1 AND status = 'available' RETURNING {}",
                    STORY_COLUMNS
                )
                .as_str(),
                &[&id],
            )
            .map_err(pg_err)?;
        match row {
            Some(row) => story_from_row(&row),
            None => Err(status_conflict(&mut *client, id, StoryStatus::Available)),
        }
    }

    fn begin_checkout(
        &self,
        story_id: StoryId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> Result<CheckoutEntry, StorageError> {
        let mut client = self.client()?;
        let mut tx = client.transaction().map_err(pg_err)?;

        if !exists(&mut tx, "users", user_id)? {
            return Err(StorageError::UserNotFound(user_id.to_string()));
        }
        // The row lock taken here serializes racing checkouts of one story.
        let changed = tx
            .execute(
                "UPDATE stories SET status = 'checked_out' WHERE id = $1 AND status = 'available'",
                &[&story_id],
            )
            .map_err(pg_err)?;
        if changed == 0 {
            return Err(status_conflict(&mut tx, story_id, StoryStatus::Available));
        }

        let row = tx
            .query_one(
                format!(
                    "INSERT INTO checkout_log (story_id, user_id, checked_out_at, auto_checkin, words_added)
                     VALUES ($1, $2, $3, FALSE, 0) RETURNING {}",
                    CHECKOUT_COLUMNS
                )
                .as_str(),
                &[&story_id, &user_id, &at.unix_timestamp()],
            )
            .map_err(pg_err)?;
        let entry = checkout_from_row(&row)?;
        tx.commit().map_err(pg_err)?;

        tracing::debug!(story_id, user_id, checkout_id = entry.id, "PostgreSQL checkout opened");
        Ok(entry)
    }

    fn open_checkout(&self, story_id: StoryId) -> Result<Option<CheckoutEntry>, StorageError> {
        let mut client = self.client()?;
        client
            .query_opt(
                format!(
                    "SELECT {} FROM checkout_log WHERE story_id = $1 AND checked_in_at IS NULL
                     ORDER BY checked_out_at DESC, id DESC LIMIT 1",
                    CHECKOUT_COLUMNS
                )
                .as_str(),
                &[&story_id],
            )
            .map_err(pg_err)?
            .map(|row| checkout_from_row(&row))
            .transpose()
    }

    fn complete_checkin(
        &self,
        checkout_id: CheckoutId,
        at: OffsetDateTime,
        words_added: u64,
        next_status: StoryStatus,
    ) -> Result<CheckoutEntry, StorageError> {
        let mut client = self.client()?;
        let mut tx = client.transaction().map_err(pg_err)?;

        let entry = tx
            .query_opt(
                format!("SELECT {} FROM checkout_log WHERE id = $1 FOR UPDATE", CHECKOUT_COLUMNS).as_str(),
                &[&checkout_id],
            )
            .map_err(pg_err)?
            .ok_or(StorageError::CheckoutNotFound(checkout_id))
            .and_then(|row| checkout_from_row(&row))?;
        if !entry.is_open() {
            return Err(StorageError::CheckoutClosed(checkout_id));
        }

        let words = words_added as i64;
        let changed = tx
            .execute(
                "UPDATE stories SET status = $2, word_count = word_count + $3
                 WHERE id = $1 AND status = 'checked_out'",
                &[&entry.story_id, &next_status.as_str(), &words],
            )
            .map_err(pg_err)?;
        if changed == 0 {
            return Err(status_conflict(&mut tx, entry.story_id, StoryStatus::CheckedOut));
        }

        let row = tx
            .query_one(
                format!(
                    "UPDATE checkout_log SET checked_in_at = $2, words_added = $3 WHERE id = $1 RETURNING {}",
                    CHECKOUT_COLUMNS
                )
                .as_str(),
                &[&checkout_id, &at.unix_timestamp(), &words],
            )
            .map_err(pg_err)?;
        tx.execute(
            "INSERT INTO story_contributors (story_id, user_id, contributed_at) VALUES ($1, $2, $3)
             ON CONFLICT (story_id, user_id) DO NOTHING",
            &[&entry.story_id, &entry.user_id, &at.unix_timestamp()],
        )
        .map_err(pg_err)?;

        let closed = checkout_from_row(&row)?;
        tx.commit().map_err(pg_err)?;
        Ok(closed)
    }

    fn expired_checkouts(&self, cutoff: OffsetDateTime) -> Result<Vec<CheckoutEntry>, StorageError> {
        let mut client = self.client()?;
        let rows = client
            .query(
                format!(
                    "SELECT {} FROM checkout_log WHERE checked_in_at IS NULL AND checked_out_at < $1
                     ORDER BY checked_out_at, id",
                    CHECKOUT_COLUMNS
                )
                .as_str(),
                &[&cutoff.unix_timestamp()],
            )
            .map_err(pg_err)?;
        rows.iter().map(checkout_from_row).collect()
    }

    fn reclaim_checkout(&self, checkout_id: CheckoutId, at: OffsetDateTime) -> Result<bool, StorageError> {
        let mut client = self.client()?;
        let mut tx = client.transaction().map_err(pg_err)?;

        let story_id: Option<StoryId> = tx
            .query_opt(
                "UPDATE checkout_log SET checked_in_at = $2, auto_checkin = TRUE, words_added = 0
                 WHERE id = $1 AND checked_in_at IS NULL RETURNING story_id",
                &[&checkout_id, &at.unix_timestamp()],
            )
            .map_err(pg_err)?
            .map(|row| row.get(0));
        let story_id = match story_id {
            Some(id) => id,
            None => {
                load_checkout(&mut tx, checkout_id)?;
                return Ok(false);
            }
        };

        tx.execute(
            "UPDATE stories SET status = 'available' WHERE id = $1 AND status = 'checked_out'",
            &[&story_id],
        )
        .map_err(pg_err)?;
        tx.commit().map_err(pg_err)?;
        Ok(true)
    }

    fn ledger(&self, story_id: StoryId) -> Result<Ledger, StorageError> {
        let mut client = self.client()?;
        load_story(&mut *client, story_id)?;
        let rows = client
            .query(
                format!(
                    "SELECT {} FROM checkout_log WHERE story_id = $1 ORDER BY checked_out_at, id",
                    CHECKOUT_COLUMNS
                )
                .as_str(),
                &[&story_id],
            )
            .map_err(pg_err)?;
        let entries = rows
            .iter()
            .map(checkout_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Ledger { story_id, entries })
    }

    fn contributors(&self, story_id: StoryId) -> Result<Vec<ContributorSummary>, StorageError> {
        let mut client = self.client()?;
        let rows = client
            .query(
                "SELECT sc.user_id, u.username, u.pen_name, sc.contributed_at,
                        (SELECT COALESCE(SUM(cl.words_added), 0)::BIGINT FROM checkout_log cl
                          WHERE cl.story_id = sc.story_id AND cl.user_id = sc.user_id)
                 FROM story_contributors sc
                 JOIN users u ON u.id = sc.user_id
                 WHERE sc.story_id = $1
                 ORDER BY sc.contributed_at, sc.user_id",
                &[&story_id],
            )
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| {
                Ok(ContributorSummary {
                    user_id: row.get(0),
                    username: arc(row, 1),
                    pen_name: arc_opt(row, 2),
                    contributed_at: ts(row.get(3))?,
                    total_words: row.get::<_, i64>(4) as u64,
                })
            })
            .collect()
    }
}
