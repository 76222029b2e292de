use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use oola::{
    api::{self, AppState},
    clock::{Clock, SystemClock},
    config::{CliArgs, Command, Config, ContentConfig, ContentKind, LoggingConfig, StorageConfig, StorageKind},
    content::{ContentError, ContentStore, InMemoryContentStore},
    github::{GitHubConfig, GitHubContentStore},
    postgres_storage::PostgresStorage,
    reclaimer::Reclaimer,
    service::StoryService,
    sqlite_storage::SqliteStorage,
    storage::{InMemoryStorage, StorageBackend, StorageError},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let storage: Arc<dyn StorageBackend> = match config.backend {
        StorageKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageKind::Sqlite => Arc::new(SqliteStorage::new(&config.path)?),
        StorageKind::Postgres => {
            let url = config.url.as_deref().ok_or_else(|| {
                StorageError::Other("storage.url is required for the postgres backend".to_string())
            })?;
            Arc::new(PostgresStorage::new(url)?)
        }
    };
    Ok(storage)
}

fn build_content(config: &Config) -> Result<Arc<dyn ContentStore>, ContentError> {
    let content: &ContentConfig = &config.content;
    match content.backend {
        ContentKind::Github => {
            if content.token.is_none() {
                tracing::warn!("No GitHub token configured; writes to the content host will be rejected");
            }
            Ok(Arc::new(GitHubContentStore::new(GitHubConfig {
                api_url: content.api_url.clone(),
                owner: content.owner.clone(),
                token: content.token.clone(),
                timeout: std::time::Duration::from_secs(content.timeout_secs),
            })?))
        }
        ContentKind::Memory => {
            let store = InMemoryContentStore::new();
            for language in &config.languages {
                store.add_container(&language.container());
            }
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn serve(config: Config, storage: Arc<dyn StorageBackend>) -> Result<(), BoxError> {
    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = config.checkout_policy();
    let content = build_content(&config)?;
    let service = Arc::new(StoryService::new(
        storage.clone(),
        content,
        clock.clone(),
        policy.clone(),
    ));

    service
        .seed_reference_data(
            config.languages.iter().map(|l| l.to_new_language()).collect(),
            config.genres.clone(),
        )
        .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reclaimer = if config.reclaimer.enabled {
        let reclaimer = Reclaimer::new(
            storage.clone(),
            clock,
            config.reclaim_interval(),
            policy.checkout_duration,
        );
        Some(tokio::spawn(reclaimer.run(shutdown_rx)))
    } else {
        tracing::info!("Reclaimer disabled");
        None
    };

    let app = api::router(
        AppState { service, metrics },
        Arc::new(config.auth.clone()),
    );

    let addr = config.listen_addr()?;
    tracing::info!(%addr, auth = config.auth.enabled, "OOLA API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = reclaimer {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Reclaimer task failed");
        }
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn reclaim(config: &Config, storage: Arc<dyn StorageBackend>) -> Result<(), BoxError> {
    let reclaimer = Reclaimer::new(
        storage,
        Arc::new(SystemClock),
        config.reclaim_interval(),
        config.checkout_policy().checkout_duration,
    );
    let report = reclaimer.run_once().await?;
    println!("Reclaimed {} checkout(s), {} failed", report.reclaimed, report.failed);
    Ok(())
}

fn run(cli: CliArgs, config: Config) -> Result<(), BoxError> {
    // The blocking postgres client must be created and dropped outside the runtime.
    let storage = build_storage(&config.storage)?;

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Ledger { story_id } => {
            let story = storage.get_story(story_id)?;
            let ledger = storage.ledger(story_id)?;
            println!("{} ({}, {} words)", story.title, story.status, story.word_count);
            print!("{}", ledger);
            Ok(())
        }
        command => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let result = match command {
                Command::Reclaim => runtime.block_on(reclaim(&config, storage.clone())),
                _ => runtime.block_on(serve(config, storage.clone())),
            };
            drop(runtime);
            result
        }
    };
    drop(storage);
    result
}

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_tracing(&config.logging);

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "oola exited with an error");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
