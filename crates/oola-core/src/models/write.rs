use std::sync::Arc;

use time::OffsetDateTime;

use super::{GenreId, LanguageId, Role, UserId};

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub username: Arc<str>,
    pub email: Arc<str>,
    pub role: Role,
    pub pen_name: Option<Arc<str>>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLanguage {
    pub name: Arc<str>,
    pub code: Arc<str>,
    /// Remote repository holding this language's stories.
    pub container: Arc<str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStory {
    pub title: Arc<str>,
    pub theme: Arc<str>,
    pub initial_plot: Option<Arc<str>>,
    pub language_id: LanguageId,
    pub genre_id: GenreId,
    pub creator_id: UserId,
    pub created_at: OffsetDateTime,
}
