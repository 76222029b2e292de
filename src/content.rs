//! Content store contract.
//!
//! Story text lives outside the relational store, in a versioned file host.
//! Every read hands back a [`VersionToken`] which must be surrendered on the
//! next conditional write, so a write is always tied to the read it is based
//! on.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("content not found: {container}/{path}")]
    NotFound { container: String, path: String },
    #[error("version conflict on {container}/{path}")]
    Conflict { container: String, path: String },
    #[error("content host error: {0}")]
    Upstream(String),
}

/// Opaque version of a stored blob. Deliberately not `Clone`: one read
/// authorises at most one write.
#[derive(Debug, PartialEq, Eq)]
pub struct VersionToken(String);

impl VersionToken {
    pub(crate) fn from_opaque(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
pub struct VersionedContent {
    pub content: String,
    pub token: VersionToken,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(
        &self,
        container: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<VersionToken, ContentError>;

    async fn read(&self, container: &str, path: &str) -> Result<VersionedContent, ContentError>;

    async fn update(
        &self,
        container: &str,
        path: &str,
        content: &str,
        message: &str,
        expected: VersionToken,
    ) -> Result<VersionToken, ContentError>;

    async fn container_exists(&self, container: &str) -> bool;
}

/// Derives the file name of a story: `story-<id>-<slug>.md`.
///
/// The slug is the lower-cased title with every run of characters outside
/// `[a-z0-9]` collapsed to a single `-`, trimmed at both ends. The id prefix
/// keeps stories with identical titles apart.
pub fn story_filename(story_id: i64, title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        format!("story-{}.md", story_id)
    } else {
        format!("story-{}-{}.md", story_id, slug)
    }
}

pub struct StoryHeader<'a> {
    pub title: &'a str,
    pub theme: &'a str,
    pub initial_plot: Option<&'a str>,
    pub genre: &'a str,
    pub language: &'a str,
    pub creator: &'a str,
}

/// Initial markdown document written when a story is created.
pub fn format_story_header(header: &StoryHeader<'_>) -> String {
    let plot = header.initial_plot.filter(|p| !p.trim().is_empty());
    let mut doc = format!(
        "# {}\n\n**Genre:** {}\n**Language:** {}\n**Created by:** {}\n\n## Theme\n{}\n\n",
        header.title, header.genre, header.language, header.creator, header.theme
    );
    if let Some(plot) = plot {
        doc.push_str(&format!("## Initial Plot\n{}\n\n", plot));
    }
    doc.push_str("---\n\n## Story Content\n\n");
    if let Some(plot) = plot {
        doc.push_str(plot);
    }
    doc
}

/// Appends an attributed, dated contribution section to `existing`.
pub fn append_contribution(
    existing: &str,
    author: &str,
    at: OffsetDateTime,
    word_count: usize,
    text: &str,
) -> String {
    format!(
        "{}\n\n---\n\n### Contribution by {} ({})\nWords: {}\n\n{}",
        existing,
        author,
        at.date(),
        word_count,
        text
    )
}

struct StoredBlob {
    content: String,
    version: String,
}

#[derive(Default)]
struct Faults {
    reads: Option<ContentError>,
    updates: Option<ContentError>,
    creates: Option<ContentError>,
    latency: Option<Duration>,
}

/// Content store kept in process memory. Containers exist once registered
/// or once a file has been created in them.
#[derive(Default)]
pub struct InMemoryContentStore {
    blobs: Mutex<HashMap<(String, String), StoredBlob>>,
    containers: Mutex<Vec<String>>,
    faults: Mutex<Faults>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_container(&self, container: &str) {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        if !containers.iter().any(|c| c == container) {
            containers.push(container.to_string());
        }
    }

    /// Current text of a file, bypassing version tracking.
    pub fn get(&self, container: &str, path: &str) -> Option<String> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(container.to_string(), path.to_string()))
            .map(|b| b.content.clone())
    }

    pub fn fail_reads(&self, error: Option<ContentError>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).reads = error;
    }

    pub fn fail_updates(&self, error: Option<ContentError>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).updates = error;
    }

    pub fn fail_creates(&self, error: Option<ContentError>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).creates = error;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).latency = latency;
    }

    async fn before_call(&self) {
        let latency = self.faults.lock().unwrap_or_else(|e| e.into_inner()).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected(&self, pick: fn(&Faults) -> &Option<ContentError>) -> Result<(), ContentError> {
        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match pick(&faults) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn create(
        &self,
        container: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<VersionToken, ContentError> {
        self.before_call().await;
        self.injected(|f| &f.creates)?;

        let key = (container.to_string(), path.to_string());
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        if blobs.contains_key(&key) {
            return Err(ContentError::Upstream(format!(
                "{}/{} already exists",
                container, path
            )));
        }
        let version = Uuid::new_v4().to_string();
        blobs.insert(
            key,
            StoredBlob {
                content: content.to_string(),
                version: version.clone(),
            },
        );
        drop(blobs);
        self.add_container(container);
        Ok(VersionToken(version))
    }

    async fn read(&self, container: &str, path: &str) -> Result<VersionedContent, ContentError> {
        self.before_call().await;
        self.injected(|f| &f.reads)?;

        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        match blobs.get(&(container.to_string(), path.to_string())) {
            Some(blob) => Ok(VersionedContent {
                content: blob.content.clone(),
                token: VersionToken(blob.version.clone()),
            }),
            None => Err(ContentError::NotFound {
                container: container.to_string(),
                path: path.to_string(),
            }),
        }
    }

    async fn update(
        &self,
        container: &str,
        path: &str,
        content: &str,
        _message: &str,
        expected: VersionToken,
    ) -> Result<VersionToken, ContentError> {
        self.before_call().await;
        self.injected(|f| &f.updates)?;

        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        let blob = blobs
            .get_mut(&(container.to_string(), path.to_string()))
            .ok_or_else(|| ContentError::NotFound {
                container: container.to_string(),
                path: path.to_string(),
            })?;
        if blob.version != expected.0 {
            return Err(ContentError::Conflict {
                container: container.to_string(),
                path: path.to_string(),
            });
        }
        blob.content = content.to_string();
        blob.version = Uuid::new_v4().to_string();
        Ok(VersionToken(blob.version.clone()))
    }

    async fn container_exists(&self, container: &str) -> bool {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|c| c == container)
    }
}
