use std::{sync::Arc, time::Duration as StdDuration};

use time::Duration;
use tokio::sync::watch;

use crate::{
    clock::Clock,
    storage::{run_blocking, StorageBackend, StorageError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    pub failed: usize,
}

/// Periodically force-checks-in checkouts held past their deadline.
pub struct Reclaimer {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    interval: StdDuration,
    checkout_duration: Duration,
}

impl Reclaimer {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        interval: StdDuration,
        checkout_duration: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            interval,
            checkout_duration,
        }
    }

    /// One sweep. Each expired entry is reclaimed on its own; a failure is
    /// logged and the sweep moves on.
    pub async fn run_once(&self) -> Result<ReclaimReport, StorageError> {
        let now = self.clock.now();
        let cutoff = now - self.checkout_duration;
        let expired = run_blocking(&self.storage, move |s| s.expired_checkouts(cutoff)).await?;

        let mut report = ReclaimReport::default();
        for entry in expired {
            let checkout_id = entry.id;
            match run_blocking(&self.storage, move |s| s.reclaim_checkout(checkout_id, now)).await {
                Ok(true) => {
                    report.reclaimed += 1;
                    metrics::increment_counter!("oola_reclaimed_total");
                    tracing::info!(
                        story_id = entry.story_id,
                        user_id = entry.user_id,
                        checkout_id,
                        checked_out_at = %entry.checked_out_at,
                        "Expired checkout reclaimed"
                    );
                }
                // Checked in between the scan and the reclaim.
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(story_id = entry.story_id, checkout_id, error = %e, "Failed to reclaim checkout");
                }
            }
        }

        if report.reclaimed > 0 || report.failed > 0 {
            tracing::info!(reclaimed = report.reclaimed, failed = report.failed, "Reclaim sweep finished");
        }
        Ok(report)
    }

    /// Sweeps on every interval tick until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Reclaimer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Reclaim sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Reclaimer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, storage::InMemoryStorage};
    use oola_core::{NewLanguage, NewStory, NewUser, Role, StoryId, StoryStatus, UserId};
    use time::macros::datetime;

    fn seed(storage: &InMemoryStorage, title: &str) -> (StoryId, UserId) {
        let at = datetime!(2024-05-01 12:00 UTC);
        let user = match storage.find_user("asha").unwrap() {
            Some(user) => user,
            None => storage
                .create_user(&NewUser {
                    username: Arc::from("asha"),
                    email: Arc::from("asha@example.com"),
                    role: Role::Author,
                    pen_name: None,
                    created_at: at,
                })
                .unwrap(),
        };
        let language = storage
            .upsert_language(&NewLanguage {
                name: Arc::from("English"),
                code: Arc::from("en"),
                container: Arc::from("oola-stories-english"),
            })
            .unwrap();
        let genre = storage.upsert_genre("Horror").unwrap();
        let story = storage
            .create_story(&NewStory {
                title: Arc::from(title),
                theme: Arc::from("dread"),
                initial_plot: None,
                language_id: language.id,
                genre_id: genre.id,
                creator_id: user.id,
                created_at: at,
            })
            .unwrap();
        (story.id, user.id)
    }

    #[tokio::test]
    async fn test_sweep_reclaims_only_expired() {
        let storage = Arc::new(InMemoryStorage::new());
        let (old, user) = seed(&storage, "Old");
        let (fresh, _) = seed(&storage, "Fresh");
        storage
            .begin_checkout(old, user, datetime!(2024-05-01 12:00 UTC))
            .unwrap();
        storage
            .begin_checkout(fresh, user, datetime!(2024-05-06 12:00 UTC))
            .unwrap();

        let clock = Arc::new(ManualClock::new(datetime!(2024-05-08 13:00 UTC)));
        let reclaimer = Reclaimer::new(
            storage.clone(),
            clock,
            StdDuration::from_secs(3600),
            Duration::days(7),
        );

        let report = reclaimer.run_once().await.unwrap();
        assert_eq!(report, ReclaimReport { reclaimed: 1, failed: 0 });

        let entry = &storage.ledger(old).unwrap().entries[0];
        assert!(entry.auto_checkin);
        assert_eq!(entry.words_added, 0);
        assert_eq!(entry.checked_in_at, Some(datetime!(2024-05-08 13:00 UTC)));
        assert_eq!(storage.get_story(old).unwrap().status, StoryStatus::Available);
        assert_eq!(storage.get_story(old).unwrap().word_count, 0);
        assert_eq!(storage.get_story(fresh).unwrap().status, StoryStatus::CheckedOut);

        assert_eq!(reclaimer.run_once().await.unwrap().reclaimed, 0);
    }

    #[tokio::test]
    async fn test_exact_deadline_is_not_expired() {
        let storage = Arc::new(InMemoryStorage::new());
        let (story, user) = seed(&storage, "Edge");
        storage
            .begin_checkout(story, user, datetime!(2024-05-01 12:00 UTC))
            .unwrap();

        let clock = Arc::new(ManualClock::new(datetime!(2024-05-08 12:00 UTC)));
        let reclaimer = Reclaimer::new(
            storage.clone(),
            clock.clone(),
            StdDuration::from_secs(3600),
            Duration::days(7),
        );
        assert_eq!(reclaimer.run_once().await.unwrap().reclaimed, 0);

        clock.advance(Duration::seconds(1));
        assert_eq!(reclaimer.run_once().await.unwrap().reclaimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sweeps_on_interval_until_shutdown() {
        let storage = Arc::new(InMemoryStorage::new());
        let (story, user) = seed(&storage, "Loop");
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        storage
            .begin_checkout(story, user, datetime!(2024-05-01 12:00 UTC))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let reclaimer = Reclaimer::new(
            storage.clone(),
            clock.clone(),
            StdDuration::from_secs(60),
            Duration::days(7),
        );
        let handle = tokio::spawn(reclaimer.run(rx));

        tokio::time::sleep(StdDuration::from_secs(61)).await;
        assert_eq!(storage.get_story(story).unwrap().status, StoryStatus::CheckedOut);

        clock.advance(Duration::days(8));
        tokio::time::sleep(StdDuration::from_secs(61)).await;
        assert_eq!(storage.get_story(story).unwrap().status, StoryStatus::Available);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
