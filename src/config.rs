use std::{net::SocketAddr, time::Duration as StdDuration};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use oola_core::{NewLanguage, StoryId};

use crate::{github::DEFAULT_API_URL, policy::CheckoutPolicy};

#[derive(Parser, Debug)]
#[command(name = "oola", about = "OOLA - collaborative storytelling backend")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "oola.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server and the background reclaimer (default)
    Serve,
    /// Run a single reclaim sweep and exit
    Reclaim,
    /// Print the checkout ledger of a story
    Ledger { story_id: StoryId },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub content: ContentConfig,

    #[serde(default)]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    pub reclaimer: ReclaimerConfig,

    #[serde(default = "default_languages")]
    pub languages: Vec<LanguageEntry>,

    #[serde(default = "default_genres")]
    pub genres: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When true, all API endpoints (except /health and /metrics) require an API key.
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys, each acting as one registered user.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
    /// Username of the account this key acts as.
    pub user: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageKind,

    /// SQLite database path.
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// PostgreSQL connection string.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Github,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_content_backend")]
    pub backend: ContentKind,

    /// Account or organisation owning the per-language repositories.
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Falls back to the GITHUB_TOKEN environment variable.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckoutConfig {
    #[serde(default = "default_duration_days")]
    pub duration_days: i64,

    #[serde(default = "default_min_words")]
    pub min_words: usize,

    #[serde(default = "default_max_words")]
    pub max_words: usize,

    /// Finish a story once its word count reaches this many words.
    #[serde(default)]
    pub finish_at_words: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReclaimerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LanguageEntry {
    pub name: String,
    pub code: String,
    /// Repository holding this language's stories. Defaults to `oola-stories-<name>`.
    #[serde(default)]
    pub container: Option<String>,
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_backend() -> StorageKind {
    StorageKind::Sqlite
}

fn default_sqlite_path() -> String {
    "oola.db".to_string()
}

fn default_content_backend() -> ContentKind {
    ContentKind::Github
}

fn default_owner() -> String {
    "oola".to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_duration_days() -> i64 {
    7
}

fn default_min_words() -> usize {
    50
}

fn default_max_words() -> usize {
    1312
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_languages() -> Vec<LanguageEntry> {
    [("English", "en"), ("Tamil", "ta"), ("Spanish", "es"), ("French", "fr")]
        .into_iter()
        .map(|(name, code)| LanguageEntry {
            name: name.to_string(),
            code: code.to_string(),
            container: None,
        })
        .collect()
}

fn default_genres() -> Vec<String> {
    [
        "Fiction",
        "Non-Fiction",
        "Fantasy",
        "Science Fiction",
        "Mystery",
        "Romance",
        "Thriller",
        "Horror",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: default_storage_backend(),
            path: default_sqlite_path(),
            url: None,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        ContentConfig {
            backend: default_content_backend(),
            owner: default_owner(),
            token: None,
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        CheckoutConfig {
            duration_days: default_duration_days(),
            min_words: default_min_words(),
            max_words: default_max_words(),
            finish_at_words: None,
        }
    }
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        ReclaimerConfig {
            enabled: true,
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            content: ContentConfig::default(),
            checkout: CheckoutConfig::default(),
            reclaimer: ReclaimerConfig::default(),
            languages: default_languages(),
            genres: default_genres(),
        }
    }
}

impl LanguageEntry {
    pub fn container(&self) -> String {
        match &self.container {
            Some(c) => c.clone(),
            None => format!("oola-stories-{}", self.name.to_lowercase()),
        }
    }

    pub fn to_new_language(&self) -> NewLanguage {
        NewLanguage {
            name: self.name.as_str().into(),
            code: self.code.as_str().into(),
            container: self.container().into(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if config.content.token.is_none() {
            config.content.token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        }

        config
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    pub fn checkout_policy(&self) -> CheckoutPolicy {
        CheckoutPolicy {
            checkout_duration: time::Duration::days(self.checkout.duration_days),
            min_words: self.checkout.min_words,
            max_words: self.checkout.max_words,
            finish_at_words: self.checkout.finish_at_words,
            remote_timeout: StdDuration::from_secs(self.content.timeout_secs),
        }
    }

    pub fn reclaim_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.reclaimer.interval_secs.max(1))
    }
}
