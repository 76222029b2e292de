use std::{fmt::Display, str::FromStr, sync::Arc};

use prettytable::{row, Table};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub mod write;

pub type UserId = i64;
pub type StoryId = i64;
pub type CheckoutId = i64;
pub type LanguageId = i64;
pub type GenreId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Author,
    Reader,
    Artist,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Author => "author",
            Role::Reader => "reader",
            Role::Artist => "artist",
        }
    }

    /// Whether this role may check stories out and contribute text.
    pub fn can_author(&self) -> bool {
        matches!(self, Role::Author)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(Role::Author),
            "reader" => Ok(Role::Reader),
            "artist" => Ok(Role::Artist),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Available,
    CheckedOut,
    Finished,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Available => "available",
            StoryStatus::CheckedOut => "checked_out",
            StoryStatus::Finished => "finished",
        }
    }
}

impl FromStr for StoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(StoryStatus::Available),
            "checked_out" => Ok(StoryStatus::CheckedOut),
            "finished" => Ok(StoryStatus::Finished),
            other => Err(format!("unknown story status: {}", other)),
        }
    }
}

impl Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: Arc<str>,
    pub email: Arc<str>,
    pub role: Role,
    pub pen_name: Option<Arc<str>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// Name used when attributing contributions: the pen name if one is set.
    pub fn display_name(&self) -> &str {
        match &self.pen_name {
            Some(p) if !p.trim().is_empty() => p,
            _ => &self.username,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Language {
    pub id: LanguageId,
    pub name: Arc<str>,
    pub code: Arc<str>,
    pub container: Arc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Genre {
    pub id: GenreId,
    pub name: Arc<str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: StoryId,
    pub title: Arc<str>,
    pub theme: Arc<str>,
    pub initial_plot: Option<Arc<str>>,
    pub language_id: LanguageId,
    pub genre_id: GenreId,
    pub creator_id: UserId,
    /// Path of the story file inside the language's container, once created.
    pub file_path: Option<Arc<str>>,
    pub status: StoryStatus,
    pub word_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A story joined with the names a listing shows next to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryView {
    #[serde(flatten)]
    pub story: Story,
    pub language_name: Arc<str>,
    pub container: Arc<str>,
    pub genre_name: Arc<str>,
    pub creator_name: Arc<str>,
    pub creator_pen_name: Option<Arc<str>>,
}

impl StoryView {
    pub fn new(story: Story, language: &Language, genre: &Genre, creator: &User) -> Self {
        StoryView {
            story,
            language_name: language.name.clone(),
            container: language.container.clone(),
            genre_name: genre.name.clone(),
            creator_name: creator.username.clone(),
            creator_pen_name: creator.pen_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutEntry {
    pub id: CheckoutId,
    pub story_id: StoryId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_out_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub checked_in_at: Option<OffsetDateTime>,
    pub auto_checkin: bool,
    pub words_added: u64,
}

impl CheckoutEntry {
    pub fn is_open(&self) -> bool {
        self.checked_in_at.is_none()
    }

    pub fn deadline(&self, duration: Duration) -> OffsetDateTime {
        self.checked_out_at + duration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributorSummary {
    pub user_id: UserId,
    pub username: Arc<str>,
    pub pen_name: Option<Arc<str>>,
    #[serde(with = "time::serde::rfc3339")]
    pub contributed_at: OffsetDateTime,
    pub total_words: u64,
}

/// Checkout history of a single story, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub story_id: StoryId,
    pub entries: Vec<CheckoutEntry>,
}

impl Ledger {
    /// The entry currently holding the story. Duplicated open entries resolve
    /// to the latest checkout, then the highest id.
    pub fn open_entry(&self) -> Option<&CheckoutEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_open())
            .max_by_key(|e| (e.checked_out_at, e.id))
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_open()).count()
    }

    pub fn words_by(&self, user_id: UserId) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.words_added)
            .sum()
    }
}

impl Display for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Checkout", "User", "Checked out", "Checked in", "Auto", "Words"]);
        table.add_empty_row();

        for entry in &self.entries {
            let checked_in = match entry.checked_in_at {
                Some(t) => t.to_string(),
                None => "open".to_string(),
            };
            table.add_row(row![
                entry.id,
                entry.user_id,
                entry.checked_out_at,
                checked_in,
                if entry.auto_checkin { "yes" } else { "" },
                entry.words_added
            ]);
        }

        write!(f, "\n{}\n", table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn entry(id: CheckoutId, at: OffsetDateTime, open: bool) -> CheckoutEntry {
        CheckoutEntry {
            id,
            story_id: 1,
            user_id: 7,
            checked_out_at: at,
            checked_in_at: if open { None } else { Some(at + Duration::hours(1)) },
            auto_checkin: false,
            words_added: if open { 0 } else { 100 },
        }
    }

    #[test]
    fn test_open_entry_prefers_latest() {
        let ledger = Ledger {
            story_id: 1,
            entries: vec![
                entry(1, datetime!(2024-01-01 00:00 UTC), false),
                entry(2, datetime!(2024-01-02 00:00 UTC), true),
                entry(3, datetime!(2024-01-03 00:00 UTC), true),
                entry(4, datetime!(2024-01-03 00:00 UTC), true),
            ],
        };
        assert_eq!(ledger.open_entry().map(|e| e.id), Some(4));
        assert_eq!(ledger.open_count(), 3);
        assert_eq!(ledger.words_by(7), 100);
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        let mut user = User {
            id: 1,
            username: Arc::from("asha"),
            email: Arc::from("asha@example.com"),
            role: Role::Author,
            pen_name: None,
            created_at: datetime!(2024-01-01 00:00 UTC),
        };
        assert_eq!(user.display_name(), "asha");
        user.pen_name = Some(Arc::from("A. Writer"));
        assert_eq!(user.display_name(), "A. Writer");
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("author".parse::<Role>(), Ok(Role::Author));
        assert!("editor".parse::<Role>().is_err());
        assert!(Role::Author.can_author());
        assert!(!Role::Reader.can_author());
        assert!(!Role::Artist.can_author());
    }
}
