use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oola::clock::SystemClock;
use oola::content::{append_contribution, InMemoryContentStore};
use oola::policy::{count_words, CheckoutPolicy};
use oola::service::{CreateStory, RegisterUser, StoryService};
use oola::sqlite_storage::SqliteStorage;
use oola::storage::{InMemoryStorage, StorageBackend};
use oola_core::{NewLanguage, NewStory, NewUser, Role, StoryId, StoryStatus, UserId};
use time::OffsetDateTime;

fn contribution(n: usize) -> String {
    (0..n).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
}

fn setup(rt: &tokio::runtime::Runtime) -> (StoryService, StoryId, UserId) {
    let content = InMemoryContentStore::shared();
    let service = StoryService::new(
        Arc::new(InMemoryStorage::new()),
        content,
        Arc::new(SystemClock),
        CheckoutPolicy::default(),
    );
    let (story_id, user_id) = rt.block_on(async {
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
        let user = service
            .register_user(RegisterUser {
                username: "bench".to_string(),
                email: "bench@example.com".to_string(),
                role: Role::Author,
                pen_name: None,
            })
            .await
            .unwrap();
        let language = service.languages().await.unwrap()[0].id;
        let genre = service.genres().await.unwrap()[0].id;
        let story = service
            .create_story(
                user.id,
                CreateStory {
                    title: "Bench".to_string(),
                    theme: "speed".to_string(),
                    initial_plot: None,
                    language_id: language,
                    genre_id: genre,
                },
            )
            .await
            .unwrap();
        (story.id, user.id)
    });
    (service, story_id, user_id)
}

fn bench_word_count(c: &mut Criterion) {
    let text = contribution(1200);
    c.bench_function("count_words_1200", |b| b.iter(|| count_words(black_box(&text))));

    let existing = contribution(20_000);
    let now = OffsetDateTime::now_utc();
    c.bench_function("append_contribution", |b| {
        b.iter(|| append_contribution(black_box(&existing), "bench", now, 1200, black_box(&text)))
    });
}

fn bench_service_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (service, story_id, user_id) = setup(&rt);
    let text = contribution(300);

    c.bench_function("checkout_checkin_memory", |b| {
        b.iter(|| {
            rt.block_on(async {
                service.checkout(story_id, user_id).await.unwrap();
                service.checkin(story_id, user_id, black_box(&text)).await.unwrap()
            })
        })
    });
}

fn bench_sqlite_transitions(c: &mut Criterion) {
    let storage = SqliteStorage::new(":memory:").unwrap();
    let at = OffsetDateTime::now_utc();
    let user = storage
        .create_user(&NewUser {
            username: Arc::from("bench"),
            email: Arc::from("bench@example.com"),
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
    let genre = storage.upsert_genre("Fantasy").unwrap();
    let story = storage
        .create_story(&NewStory {
            title: Arc::from("Bench"),
            theme: Arc::from("speed"),
            initial_plot: None,
            language_id: language.id,
            genre_id: genre.id,
            creator_id: user.id,
            created_at: at,
        })
        .unwrap();

    c.bench_function("sqlite_begin_complete", |b| {
        b.iter(|| {
            let entry = storage.begin_checkout(story.id, user.id, at).unwrap();
            storage
                .complete_checkin(entry.id, at, 300, StoryStatus::Available)
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_word_count,
    bench_service_cycle,
    bench_sqlite_transitions
);
criterion_main!(benches);
