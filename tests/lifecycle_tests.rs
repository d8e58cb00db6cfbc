use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use sevo::artifact::{ArtifactError, ArtifactStore, DeleteOutcome, LocalArtifactStore};
use sevo::clock::ManualClock;
use sevo::ledger::{Ledger, PushSubscriptionRow};
use sevo::lifecycle::{AudioUpload, LifecycleEngine, LifecycleError};
use sevo::model::{Lifespan, GRACE_WINDOW};
use sevo::notifier::{Notifier, ServerEvent};
use sevo::presence::InMemoryPresence;
use sevo::push::{PushOutcome, PushPayload, PushSender};

const T0: u64 = 1_700_000_000_000;
const MAX_AUDIO: usize = 64 * 1024;

struct NoPush;

#[async_trait]
impl PushSender for NoPush {
    async fn send(&self, _: &PushSubscriptionRow, _: &PushPayload) -> PushOutcome {
        PushOutcome::Delivered
    }
}

/// Artifact store whose puts always fail.
struct BrokenStore;

#[async_trait]
impl ArtifactStore for BrokenStore {
    async fn put(&self, _: Vec<u8>, _: &str) -> Result<String, ArtifactError> {
        Err(ArtifactError::Backend("bucket unavailable".into()))
    }

    async fn delete(&self, _: &str) -> Result<DeleteOutcome, ArtifactError> {
        Ok(DeleteOutcome::AlreadyAbsent)
    }
}

struct Harness {
    engine: Arc<LifecycleEngine>,
    clock: Arc<ManualClock>,
    ledger: Arc<Ledger>,
    store: Arc<LocalArtifactStore>,
    notifier: Arc<Notifier>,
    dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(Ledger::open(&dir.path().join("sevo.db")).expect("ledger"));
    let store = Arc::new(
        LocalArtifactStore::open(&dir.path().join("uploads"), "http://relay.test").expect("store"),
    );
    let clock = Arc::new(ManualClock::new(T0));
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&ledger),
        Arc::new(InMemoryPresence::new()),
        Arc::new(NoPush),
    ));
    let engine = Arc::new(LifecycleEngine::new(
        Arc::clone(&ledger),
        store.clone(),
        Arc::clone(&notifier),
        clock.clone(),
        MAX_AUDIO,
    ));
    Harness {
        engine,
        clock,
        ledger,
        store,
        notifier,
        dir,
    }
}

fn wav(len: usize) -> Option<AudioUpload> {
    Some(AudioUpload {
        bytes: vec![7u8; len],
        content_type: "audio/wav".to_string(),
    })
}

fn file_name(artifact_ref: &str) -> &str {
    artifact_ref.rsplit('/').next().expect("file name")
}

fn drain(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn create_yields_unread_message_with_grace_deadline() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(128), Some("3m"))
        .await
        .expect("create");

    assert!(!msg.is_read);
    assert_eq!(msg.lifespan, Lifespan::ThreeMinutes);
    assert_eq!(msg.created_at, T0);
    assert_eq!(msg.expires_at, T0 + GRACE_WINDOW.as_millis() as u64);
    assert!(msg.artifact_ref.starts_with("http://relay.test/uploads/"));

    let stored = h.ledger.get_message(&msg.id).expect("get").expect("row");
    assert_eq!(stored, msg);
    let audio = h.store.read(file_name(&msg.artifact_ref)).await.expect("read");
    assert_eq!(audio.map(|a| a.len()), Some(128));
}

#[tokio::test]
async fn unrecognised_lifespan_becomes_three_hours() {
    let h = harness();
    for input in [Some("10y"), Some(""), Some("3M"), None] {
        let msg = h
            .engine
            .create("alice", "bob", wav(8), input)
            .await
            .expect("create");
        assert_eq!(msg.lifespan, Lifespan::ThreeHours, "{input:?}");
    }
}

#[tokio::test]
async fn invalid_audio_is_rejected_without_side_effects() {
    let h = harness();
    let cases = vec![
        None,
        wav(0),
        Some(AudioUpload {
            bytes: vec![1; 16],
            content_type: "image/png".into(),
        }),
        wav(MAX_AUDIO + 1),
    ];
    for audio in cases {
        let err = h
            .engine
            .create("alice", "bob", audio, Some("3h"))
            .await
            .expect_err("should be rejected");
        assert!(matches!(err, LifecycleError::Validation(_)), "{err:?}");
    }
    assert_eq!(h.ledger.count_messages().expect("count"), 0);
    let uploads = std::fs::read_dir(h.dir.path().join("uploads")).expect("uploads dir").count();
    assert_eq!(uploads, 0);
}

#[tokio::test]
async fn audio_with_codec_parameters_is_accepted() {
    let h = harness();
    let msg = h
        .engine
        .create(
            "alice",
            "bob",
            Some(AudioUpload {
                bytes: vec![1; 32],
                content_type: "audio/webm;codecs=opus".into(),
            }),
            None,
        )
        .await
        .expect("create");
    assert!(msg.artifact_ref.ends_with(".webm"));
}

#[tokio::test]
async fn storage_failure_aborts_send() {
    let h = harness();
    let engine = LifecycleEngine::new(
        Arc::clone(&h.ledger),
        Arc::new(BrokenStore),
        Arc::clone(&h.notifier),
        h.clock.clone(),
        MAX_AUDIO,
    );
    let err = engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect_err("put fails");
    assert!(matches!(err, LifecycleError::Storage(_)));
    assert_eq!(h.ledger.count_messages().expect("count"), 0);
}

#[tokio::test]
async fn create_notifies_both_participants() {
    let h = harness();
    let mut alice = h.notifier.join("c-alice", "alice").await;
    let mut bob = h.notifier.join("c-bob", "bob").await;

    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3h"))
        .await
        .expect("create");

    for (user, rx) in [("alice", &mut alice), ("bob", &mut bob)] {
        let events = drain(rx);
        assert_eq!(
            events,
            vec![
                ServerEvent::NewMessage {
                    message: msg.clone()
                },
                ServerEvent::UnreadCountsChanged {
                    user_id: user.to_string()
                },
            ]
        );
    }
}

#[tokio::test]
async fn mark_read_recomputes_deadline_from_lifespan() {
    let h = harness();
    for (lifespan, ttl_ms) in [("3m", 180_000), ("3h", 10_800_000), ("3d", 259_200_000)] {
        h.clock.set(T0);
        let msg = h
            .engine
            .create("alice", "bob", wav(8), Some(lifespan))
            .await
            .expect("create");

        h.clock.advance(Duration::from_secs(60));
        let read = h.engine.mark_read(&msg.id, "bob").await.expect("read");
        assert!(read.is_read);
        assert_eq!(read.expires_at, T0 + 60_000 + ttl_ms, "{lifespan}");

        let stored = h.ledger.get_message(&msg.id).expect("get").expect("row");
        assert_eq!(stored, read);
    }
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("create");
    let first = h.engine.mark_read(&msg.id, "bob").await.expect("first");

    let mut alice = h.notifier.join("c-alice", "alice").await;
    h.clock.advance(Duration::from_secs(30));
    let second = h.engine.mark_read(&msg.id, "bob").await.expect("second");

    assert_eq!(first, second);
    assert!(drain(&mut alice).is_empty(), "repeat read must not emit");
}

#[tokio::test]
async fn only_the_receiver_can_mark_read() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("create");

    for user in ["alice", "carol"] {
        let err = h
            .engine
            .mark_read(&msg.id, user)
            .await
            .expect_err("forbidden");
        assert!(matches!(err, LifecycleError::Forbidden(_)), "{user}: {err:?}");
    }

    let stored = h.ledger.get_message(&msg.id).expect("get").expect("row");
    assert_eq!(stored, msg);
}

#[tokio::test]
async fn mark_read_unknown_or_expired_is_not_found() {
    let h = harness();
    let err = h
        .engine
        .mark_read("no-such-message", "bob")
        .await
        .expect_err("absent");
    assert!(matches!(err, LifecycleError::NotFound));

    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("create");
    h.clock.advance(GRACE_WINDOW);
    let err = h
        .engine
        .mark_read(&msg.id, "bob")
        .await
        .expect_err("expired");
    assert!(matches!(err, LifecycleError::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mark_read_transitions_once() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3h"))
        .await
        .expect("create");
    let mut alice = h.notifier.join("c-alice", "alice").await;

    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let engine = Arc::clone(&h.engine);
        let clock = h.clock.clone();
        let id = msg.id.clone();
        tasks.push(tokio::spawn(async move {
            clock.advance(Duration::from_millis(i));
            engine.mark_read(&id, "bob").await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("join").expect("mark_read"));
    }
    let deadline = results[0].expires_at;
    assert!(results.iter().all(|m| m.is_read && m.expires_at == deadline));

    let stored = h.ledger.get_message(&msg.id).expect("get").expect("row");
    assert_eq!(stored.expires_at, deadline);

    let reads = drain(&mut alice)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::MessageRead { .. }))
        .count();
    assert_eq!(reads, 1);
}

#[tokio::test]
async fn get_message_is_for_participants_only() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("create");

    assert_eq!(h.engine.get_message(&msg.id, "alice").expect("sender"), msg);
    assert_eq!(h.engine.get_message(&msg.id, "bob").expect("receiver"), msg);
    assert!(matches!(
        h.engine.get_message(&msg.id, "carol"),
        Err(LifecycleError::Forbidden(_))
    ));
    assert!(matches!(
        h.engine.get_message("missing", "alice"),
        Err(LifecycleError::NotFound)
    ));
}

#[tokio::test]
async fn conversation_lists_live_messages_in_order() {
    let h = harness();
    let first = h
        .engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("first");
    h.clock.advance(Duration::from_secs(1));
    let second = h
        .engine
        .create("bob", "alice", wav(8), Some("3d"))
        .await
        .expect("second");
    h.clock.advance(Duration::from_secs(1));
    h.engine
        .create("alice", "carol", wav(8), Some("3d"))
        .await
        .expect("other pair");

    let listed = h.engine.list_conversation("bob", "alice").expect("list");
    assert_eq!(listed, vec![first.clone(), second.clone()]);

    // Reading the 3m message and letting it lapse hides it.
    h.engine.mark_read(&first.id, "bob").await.expect("read");
    h.clock.advance(Duration::from_secs(180));
    let listed = h.engine.list_conversation("alice", "bob").expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);
}

#[tokio::test]
async fn unread_counts_exclude_read_and_expired() {
    let h = harness();
    let a1 = h
        .engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("a1");
    h.engine
        .create("alice", "bob", wav(8), Some("3m"))
        .await
        .expect("a2");
    h.engine
        .create("carol", "bob", wav(8), Some("3m"))
        .await
        .expect("c1");

    let counts = h.engine.unread_counts("bob").expect("counts");
    assert_eq!(counts.get("alice"), Some(&2));
    assert_eq!(counts.get("carol"), Some(&1));

    h.engine.mark_read(&a1.id, "bob").await.expect("read");
    let counts = h.engine.unread_counts("bob").expect("counts");
    assert_eq!(counts.get("alice"), Some(&1));

    // Past the grace window every unread message has expired even though
    // no sweep has run yet.
    h.clock.advance(GRACE_WINDOW);
    assert!(h.engine.unread_counts("bob").expect("counts").is_empty());
    assert!(h.engine.unread_counts("alice").expect("counts").is_empty());
}

#[tokio::test]
async fn participant_delete_removes_row_and_artifact() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3d"))
        .await
        .expect("create");
    let mut bob = h.notifier.join("c-bob", "bob").await;

    assert!(matches!(
        h.engine.delete_message(&msg.id, "carol").await,
        Err(LifecycleError::Forbidden(_))
    ));

    h.engine
        .delete_message(&msg.id, "alice")
        .await
        .expect("delete");
    assert!(h.ledger.get_message(&msg.id).expect("get").is_none());
    assert!(h
        .store
        .read(file_name(&msg.artifact_ref))
        .await
        .expect("read")
        .is_none());
    assert!(drain(&mut bob).contains(&ServerEvent::MessageDeleted {
        message_id: msg.id.clone()
    }));

    assert!(matches!(
        h.engine.delete_message(&msg.id, "alice").await,
        Err(LifecycleError::NotFound)
    ));
}

#[tokio::test]
async fn mark_read_notifies_both_participants() {
    let h = harness();
    let msg = h
        .engine
        .create("alice", "bob", wav(8), Some("3h"))
        .await
        .expect("create");
    let mut alice = h.notifier.join("c-alice", "alice").await;
    let mut bob = h.notifier.join("c-bob", "bob").await;

    let read = h.engine.mark_read(&msg.id, "bob").await.expect("read");
    for (user, rx) in [("alice", &mut alice), ("bob", &mut bob)] {
        let events = drain(rx);
        assert_eq!(
            events,
            vec![
                ServerEvent::MessageRead {
                    message: read.clone()
                },
                ServerEvent::UnreadCountsChanged {
                    user_id: user.to_string()
                },
            ]
        );
    }
}
