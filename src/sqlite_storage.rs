use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{
    params, types::Type, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
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

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parsed<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn arc(row: &Row<'_>, idx: usize) -> rusqlite::Result<Arc<str>> {
    Ok(Arc::from(row.get::<_, String>(idx)?))
}

fn arc_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Arc<str>>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(Arc::from))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: arc(row, 1)?,
        email: arc(row, 2)?,
        role: parsed::<Role>(row, 3)?,
        pen_name: arc_opt(row, 4)?,
        created_at: ts(row, 5)?,
    })
}

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<Story> {
    Ok(Story {
        id: row.get(0)?,
        title: arc(row, 1)?,
        theme: arc(row, 2)?,
        initial_plot: arc_opt(row, 3)?,
        language_id: row.get(4)?,
        genre_id: row.get(5)?,
        creator_id: row.get(6)?,
        file_path: arc_opt(row, 7)?,
        status: parsed::<StoryStatus>(row, 8)?,
        word_count: row.get::<_, i64>(9)? as u64,
        created_at: ts(row, 10)?,
    })
}

fn checkout_from_row(row: &Row<'_>) -> rusqlite::Result<CheckoutEntry> {
    Ok(CheckoutEntry {
        id: row.get(0)?,
        story_id: row.get(1)?,
        user_id: row.get(2)?,
        checked_out_at: ts(row, 3)?,
        checked_in_at: ts_opt(row, 4)?,
        auto_checkin: row.get(5)?,
        words_added: row.get::<_, i64>(6)? as u64,
    })
}

fn load_story(conn: &Connection, id: StoryId) -> Result<Story, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM stories WHERE id = ?1", STORY_COLUMNS),
        params![id],
        story_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or(StorageError::StoryNotFound(id))
}

fn load_checkout(conn: &Connection, id: CheckoutId) -> Result<CheckoutEntry, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM checkout_log WHERE id = ?1", CHECKOUT_COLUMNS),
        params![id],
        checkout_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or(StorageError::CheckoutNotFound(id))
}

/// Explains why a guarded status update touched no row.
fn status_conflict(conn: &Connection, story_id: StoryId, expected: StoryStatus) -> StorageError {
    match load_story(conn, story_id) {
        Ok(story) => StorageError::StatusConflict {
            story_id,
            expected,
            actual: story.status,
        },
        Err(e) => e,
    }
}

fn user_exists(conn: &Connection, id: UserId) -> Result<bool, StorageError> {
    conn.query_row("SELECT COUNT(*) > 0 FROM users WHERE id = ?1", params![id], |r| r.get(0))
        .map_err(sql_err)
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(sql_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Other("sqlite connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                pen_name TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS languages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                code TEXT NOT NULL UNIQUE,
                container TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS genres (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS stories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                theme TEXT NOT NULL,
                initial_plot TEXT,
                language_id INTEGER NOT NULL,
                genre_id INTEGER NOT NULL,
                creator_id INTEGER NOT NULL,
                file_path TEXT,
                status TEXT NOT NULL DEFAULT 'available',
                word_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (language_id) REFERENCES languages(id),
                FOREIGN KEY (genre_id) REFERENCES genres(id),
                FOREIGN KEY (creator_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS story_contributors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                contributed_at INTEGER NOT NULL,
                UNIQUE (story_id, user_id),
                FOREIGN KEY (story_id) REFERENCES stories(id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS checkout_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                checked_out_at INTEGER NOT NULL,
                checked_in_at INTEGER,
                auto_checkin INTEGER NOT NULL DEFAULT 0,
                words_added INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (story_id) REFERENCES stories(id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_checkout_open
                ON checkout_log(story_id) WHERE checked_in_at IS NULL;

            CREATE INDEX IF NOT EXISTS idx_checkout_story
                ON checkout_log(story_id, checked_out_at);

            CREATE INDEX IF NOT EXISTS idx_stories_status
                ON stories(status);
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

impl StorageBackend for SqliteStorage {
    fn create_user(&self, user: &NewUser) -> Result<User, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, email, role, pen_name, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.username.as_ref(),
                user.email.as_ref(),
                user.role.as_str(),
                user.pen_name.as_deref(),
                user.created_at.unix_timestamp()
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::UserAlreadyExists(user.username.to_string())
            } else {
                sql_err(e)
            }
        })?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            user_from_row,
        )
        .map_err(sql_err)
    }

    fn get_user(&self, id: UserId) -> Result<User, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StorageError::UserNotFound(id.to_string()))
    }

    fn find_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
            params![username],
            user_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    fn upsert_language(&self, language: &NewLanguage) -> Result<Language, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO languages (name, code, container) VALUES (?1, ?2, ?3)
             ON CONFLICT(code) DO UPDATE SET name = excluded.name, container = excluded.container",
            params![
                language.name.as_ref(),
                language.code.as_ref(),
                language.container.as_ref()
            ],
        )
        .map_err(sql_err)?;
        conn.query_row(
            "SELECT id, name, code, container FROM languages WHERE code = ?1",
            params![language.code.as_ref()],
            |row| {
                Ok(Language {
                    id: row.get(0)?,
                    name: arc(row, 1)?,
                    code: arc(row, 2)?,
                    container: arc(row, 3)?,
                })
            },
        )
        .map_err(sql_err)
    }

    fn get_language(&self, id: LanguageId) -> Result<Language, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, code, container FROM languages WHERE id = ?1",
            params![id],
            |row| {
                Ok(Language {
                    id: row.get(0)?,
                    name: arc(row, 1)?,
                    code: arc(row, 2)?,
                    container: arc(row, 3)?,
                })
            },
        )
        .optional()
        .map_err(sql_err)?
        .ok_or(StorageError::LanguageNotFound(id))
    }

    fn list_languages(&self) -> Result<Vec<Language>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, code, container FROM languages ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Language {
                    id: row.get(0)?,
                    name: arc(row, 1)?,
                    code: arc(row, 2)?,
                    container: arc(row, 3)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn upsert_genre(&self, name: &str) -> Result<Genre, StorageError> {
        let conn = self.conn()?;
        conn.execute("INSERT OR IGNORE INTO genres (name) VALUES (?1)", params![name])
            .map_err(sql_err)?;
        conn.query_row(
            "SELECT id, name FROM genres WHERE name = ?1",
            params![name],
            |row| {
                Ok(Genre {
                    id: row.get(0)?,
                    name: arc(row, 1)?,
                })
            },
        )
        .map_err(sql_err)
    }

    fn get_genre(&self, id: GenreId) -> Result<Genre, StorageError> {
        let conn = self.conn()?;
        conn.query_row("SELECT id, name FROM genres WHERE id = ?1", params![id], |row| {
            Ok(Genre {
                id: row.get(0)?,
                name: arc(row, 1)?,
            })
        })
        .optional()
        .map_err(sql_err)?
        .ok_or(StorageError::GenreNotFound(id))
    }

    fn list_genres(&self) -> Result<Vec<Genre>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name FROM genres ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Genre {
                    id: row.get(0)?,
                    name: arc(row, 1)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn create_story(&self, story: &NewStory) -> Result<Story, StorageError> {
        let conn = self.conn()?;
        let exists = |table: &str, id: i64| -> Result<bool, StorageError> {
            conn.query_row(
                &format!("SELECT COUNT(*) > 0 FROM {} WHERE id = ?1", table),
                params![id],
                |r| r.get(0),
            )
            .map_err(sql_err)
        };
        if !exists("languages", story.language_id)? {
            return Err(StorageError::LanguageNotFound(story.language_id));
        }
        if !exists("genres", story.genre_id)? {
            return Err(StorageError::GenreNotFound(story.genre_id));
        }
        if !exists("users", story.creator_id)? {
            return Err(StorageError::UserNotFound(story.creator_id.to_string()));
        }

        conn.execute(
            "INSERT INTO stories (title, theme, initial_plot, language_id, genre_id, creator_id, status, word_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'available', 0, ?7)",
            params![
                story.title.as_ref(),
                story.theme.as_ref(),
                story.initial_plot.as_deref(),
                story.language_id,
                story.genre_id,
                story.creator_id,
                story.created_at.unix_timestamp()
            ],
        )
        .map_err(sql_err)?;
        load_story(&conn, conn.last_insert_rowid())
    }

    fn get_story(&self, id: StoryId) -> Result<Story, StorageError> {
        let conn = self.conn()?;
        load_story(&conn, id)
    }

    fn list_stories(&self, status: Option<StoryStatus>) -> Result<Vec<Story>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM stories WHERE ?1 IS NULL OR status = ?1 ORDER BY id",
                STORY_COLUMNS
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], story_from_row)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn set_story_file_path(&self, id: StoryId, path: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let changed = conn
            .execute("UPDATE stories SET file_path = ?2 WHERE id = ?1", params![id, path])
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StorageError::StoryNotFound(id));
        }
        Ok(())
    }

    fn delete_story(&self, id: StoryId) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let history: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM checkout_log WHERE story_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(sql_err)?;
        if history > 0 {
            return Err(StorageError::Other(format!(
                "story {} has ledger entries and cannot be deleted",
                id
            )));
        }
        let changed = conn
            .execute("DELETE FROM stories WHERE id = ?1", params![id])
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StorageError::StoryNotFound(id));
        }
        Ok(())
    }

    fn finish_story(&self, id: StoryId) -> Result<Story, StorageError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE stories SET status = 'finished' WHERE id = ?1 AND status = 'available'",
                params![id],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(status_conflict(&conn, id, StoryStatus::Available));
        }
        load_story(&conn, id)
    }

    fn begin_checkout(
        &self,
        story_id: StoryId,
        user_id: UserId,
        at: OffsetDateTime,
    ) -> Result<CheckoutEntry, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        if !user_exists(&tx, user_id)? {
            return Err(StorageError::UserNotFound(user_id.to_string()));
        }
        let changed = tx
            .execute(
                "UPDATE stories SET status = 'checked_out' WHERE id = ?1 AND status = 'available'",
                params![story_id],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(status_conflict(&tx, story_id, StoryStatus::Available));
        }

        tx.execute(
            "INSERT INTO checkout_log (story_id, user_id, checked_out_at, auto_checkin, words_added)
             VALUES (?1, ?2, ?3, 0, 0)",
            params![story_id, user_id, at.unix_timestamp()],
        )
        .map_err(sql_err)?;
        let entry = load_checkout(&tx, tx.last_insert_rowid())?;
        tx.commit().map_err(sql_err)?;

        tracing::debug!(story_id, user_id, checkout_id = entry.id, "SQLite checkout opened");
        Ok(entry)
    }

    fn open_checkout(&self, story_id: StoryId) -> Result<Option<CheckoutEntry>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM checkout_log WHERE story_id = ?1 AND checked_in_at IS NULL
                 ORDER BY checked_out_at DESC, id DESC LIMIT 1",
                CHECKOUT_COLUMNS
            ),
            params![story_id],
            checkout_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    fn complete_checkin(
        &self,
        checkout_id: CheckoutId,
        at: OffsetDateTime,
        words_added: u64,
        next_status: StoryStatus,
    ) -> Result<CheckoutEntry, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let entry = load_checkout(&tx, checkout_id)?;
        if !entry.is_open() {
            return Err(StorageError::CheckoutClosed(checkout_id));
        }

        let changed = tx
            .execute(
                "UPDATE stories SET status = ?2, word_count = word_count + ?3
                 WHERE id = ?1 AND status = 'checked_out'",
                params![entry.story_id, next_status.as_str(), words_added as i64],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(status_conflict(&tx, entry.story_id, StoryStatus::CheckedOut));
        }

        tx.execute(
            "UPDATE checkout_log SET checked_in_at = ?2, words_added = ?3 WHERE id = ?1",
            params![checkout_id, at.unix_timestamp(), words_added as i64],
        )
        .map_err(sql_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO story_contributors (story_id, user_id, contributed_at) VALUES (?1, ?2, ?3)",
            params![entry.story_id, entry.user_id, at.unix_timestamp()],
        )
        .map_err(sql_err)?;

        let closed = load_checkout(&tx, checkout_id)?;
        tx.commit().map_err(sql_err)?;
        Ok(closed)
    }

    fn expired_checkouts(&self, cutoff: OffsetDateTime) -> Result<Vec<CheckoutEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM checkout_log WHERE checked_in_at IS NULL AND checked_out_at < ?1
                 ORDER BY checked_out_at, id",
                CHECKOUT_COLUMNS
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![cutoff.unix_timestamp()], checkout_from_row)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn reclaim_checkout(&self, checkout_id: CheckoutId, at: OffsetDateTime) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let entry = load_checkout(&tx, checkout_id)?;
        if !entry.is_open() {
            return Ok(false);
        }
        tx.execute(
            "UPDATE checkout_log SET checked_in_at = ?2, auto_checkin = 1, words_added = 0 WHERE id = ?1",
            params![checkout_id, at.unix_timestamp()],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE stories SET status = 'available' WHERE id = ?1 AND status = 'checked_out'",
            params![entry.story_id],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(true)
    }

    fn ledger(&self, story_id: StoryId) -> Result<Ledger, StorageError> {
        let conn = self.conn()?;
        load_story(&conn, story_id)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM checkout_log WHERE story_id = ?1 ORDER BY checked_out_at, id",
                CHECKOUT_COLUMNS
            ))
            .map_err(sql_err)?;
        let entries = stmt
            .query_map(params![story_id], checkout_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(Ledger { story_id, entries })
    }

    fn contributors(&self, story_id: StoryId) -> Result<Vec<ContributorSummary>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT sc.user_id, u.username, u.pen_name, sc.contributed_at,
                        (SELECT COALESCE(SUM(cl.words_added), 0) FROM checkout_log cl
                          WHERE cl.story_id = sc.story_id AND cl.user_id = sc.user_id)
                 FROM story_contributors sc
                 JOIN users u ON u.id = sc.user_id
                 WHERE sc.story_id = ?1
                 ORDER BY sc.contributed_at, sc.user_id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![story_id], |row| {
                Ok(ContributorSummary {
                    user_id: row.get(0)?,
                    username: arc(row, 1)?,
                    pen_name: arc_opt(row, 2)?,
                    contributed_at: ts(row, 3)?,
                    total_words: row.get::<_, i64>(4)? as u64,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }
}
