use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use sevo::ledger::{Ledger, PushSubscriptionRow};
use sevo::model::{Lifespan, VoiceMessage};
use sevo::notifier::{ChatContext, ChatState, Notifier, ServerEvent};
use sevo::presence::{InMemoryPresence, PresenceStore};
use sevo::push::{PushOutcome, PushPayload, PushSender};

const T0: u64 = 1_700_000_000_000;

/// Push sender that records deliveries and answers from a per-endpoint
/// script (default: delivered).
#[derive(Default)]
struct ScriptedPush {
    outcomes: Mutex<HashMap<String, PushOutcome>>,
    sent: Mutex<Vec<(String, PushPayload)>>,
}

impl ScriptedPush {
    fn answer(&self, endpoint: &str, outcome: PushOutcome) {
        self.outcomes
            .lock()
            .expect("lock")
            .insert(endpoint.to_string(), outcome);
    }

    fn sent(&self) -> Vec<(String, PushPayload)> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PushSender for ScriptedPush {
    async fn send(&self, subscription: &PushSubscriptionRow, payload: &PushPayload) -> PushOutcome {
        self.sent
            .lock()
            .expect("lock")
            .push((subscription.endpoint.clone(), payload.clone()));
        self.outcomes
            .lock()
            .expect("lock")
            .get(&subscription.endpoint)
            .cloned()
            .unwrap_or(PushOutcome::Delivered)
    }
}

struct Harness {
    notifier: Arc<Notifier>,
    ledger: Arc<Ledger>,
    push: Arc<ScriptedPush>,
    presence: Arc<InMemoryPresence>,
}

fn harness() -> Harness {
    let ledger = Arc::new(Ledger::open_in_memory().expect("ledger"));
    let push = Arc::new(ScriptedPush::default());
    let presence = Arc::new(InMemoryPresence::new());
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&ledger),
        presence.clone(),
        push.clone(),
    ));
    Harness {
        notifier,
        ledger,
        push,
        presence,
    }
}

fn message(sender: &str, receiver: &str) -> VoiceMessage {
    VoiceMessage::new_unread(
        "m1".into(),
        sender.into(),
        receiver.into(),
        "http://relay.test/uploads/audio-1.wav".into(),
        Lifespan::ThreeMinutes,
        T0,
    )
}

fn drain(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn status(friend: &str, state: ChatState, context: ChatContext) -> ServerEvent {
    ServerEvent::ChatStatus {
        friend_id: friend.to_string(),
        status: state,
        context,
    }
}

#[tokio::test]
async fn emit_reaches_every_connection_of_the_user() {
    let h = harness();
    assert!(!h.notifier.is_live("bob").await);
    assert_eq!(
        h.notifier
            .emit_to_user("bob", ServerEvent::MessageDeleted { message_id: "x".into() })
            .await,
        0
    );

    let mut tab1 = h.notifier.join("c1", "bob").await;
    let mut tab2 = h.notifier.join("c2", "bob").await;
    assert!(h.notifier.is_live("bob").await);

    let event = ServerEvent::MessageDeleted {
        message_id: "x".into(),
    };
    assert_eq!(h.notifier.emit_to_user("bob", event.clone()).await, 2);
    assert_eq!(drain(&mut tab1), vec![event.clone()]);
    assert_eq!(drain(&mut tab2), vec![event]);
}

#[tokio::test]
async fn room_is_pruned_when_last_connection_leaves() {
    let h = harness();
    let rx = h.notifier.join("c1", "bob").await;
    drop(rx);
    h.notifier.disconnect("c1").await;
    assert!(!h.notifier.is_live("bob").await);
    assert_eq!(h.presence.user_of("c1"), None);
}

#[tokio::test]
async fn live_receiver_gets_no_push() {
    let h = harness();
    h.ledger
        .upsert_subscription("bob", "https://push.test/bob", "{}", T0)
        .expect("subscribe");
    let _bob = h.notifier.join("c-bob", "bob").await;

    let handle = h.notifier.notify_new_message(&message("alice", "bob")).await;
    assert!(handle.is_none());
    assert!(h.push.sent().is_empty());
}

#[tokio::test]
async fn offline_receiver_gets_push_on_every_subscription() {
    let h = harness();
    h.ledger
        .upsert_subscription("bob", "https://push.test/phone", "{\"p256dh\":\"a\"}", T0)
        .expect("subscribe");
    h.ledger
        .upsert_subscription("bob", "https://push.test/laptop", "{\"p256dh\":\"b\"}", T0)
        .expect("subscribe");
    let mut alice = h.notifier.join("c-alice", "alice").await;

    let handle = h
        .notifier
        .notify_new_message(&message("alice", "bob"))
        .await
        .expect("push started");
    handle.await.expect("push task");

    let sent = h.push.sent();
    assert_eq!(sent.len(), 2);
    for (_, payload) in &sent {
        assert_eq!(payload.data.url, "/chat/alice");
        assert_eq!(payload.data.sender_id, "alice");
    }
    // The sender still sees the live event.
    assert!(matches!(
        drain(&mut alice).first(),
        Some(ServerEvent::NewMessage { .. })
    ));
}

#[tokio::test]
async fn gone_subscription_is_removed_and_failures_are_kept() {
    let h = harness();
    h.ledger
        .upsert_subscription("bob", "https://push.test/gone", "{}", T0)
        .expect("subscribe");
    h.ledger
        .upsert_subscription("bob", "https://push.test/flaky", "{}", T0)
        .expect("subscribe");
    h.push.answer("https://push.test/gone", PushOutcome::Gone);
    h.push
        .answer("https://push.test/flaky", PushOutcome::Failed("503".into()));

    h.notifier
        .notify_new_message(&message("alice", "bob"))
        .await
        .expect("push started")
        .await
        .expect("push task");

    let remaining: Vec<String> = h
        .ledger
        .list_subscriptions("bob")
        .expect("list")
        .into_iter()
        .map(|s| s.endpoint)
        .collect();
    assert_eq!(remaining, vec!["https://push.test/flaky".to_string()]);
}

#[tokio::test]
async fn one_sided_open_only_updates_friends_list() {
    let h = harness();
    let mut alice = h.notifier.join("c-alice", "alice").await;
    let mut bob = h.notifier.join("c-bob", "bob").await;

    h.notifier.chat_opened("alice", "bob").await;

    assert_eq!(
        drain(&mut bob),
        vec![status("alice", ChatState::Opened, ChatContext::FriendsList)]
    );
    assert_eq!(
        drain(&mut alice),
        vec![status("bob", ChatState::Opened, ChatContext::FriendsList)]
    );
}

#[tokio::test]
async fn mutual_open_and_close_update_chat_window() {
    let h = harness();
    let mut alice = h.notifier.join("c-alice", "alice").await;
    let mut bob = h.notifier.join("c-bob", "bob").await;

    h.notifier.chat_opened("alice", "bob").await;
    drain(&mut alice);
    drain(&mut bob);

    h.notifier.chat_opened("bob", "alice").await;
    assert_eq!(
        drain(&mut alice),
        vec![
            status("bob", ChatState::Opened, ChatContext::FriendsList),
            status("bob", ChatState::Opened, ChatContext::ChatWindow),
        ]
    );
    assert_eq!(
        drain(&mut bob),
        vec![
            status("alice", ChatState::Opened, ChatContext::FriendsList),
            status("alice", ChatState::Opened, ChatContext::ChatWindow),
        ]
    );

    h.notifier.chat_closed("alice", "bob").await;
    assert_eq!(
        drain(&mut bob),
        vec![
            status("alice", ChatState::Closed, ChatContext::FriendsList),
            status("alice", ChatState::Closed, ChatContext::ChatWindow),
        ]
    );
    assert_eq!(h.presence.open_partner("alice"), None);
    assert_eq!(h.presence.open_partner("bob").as_deref(), Some("alice"));
}

#[tokio::test]
async fn disconnect_closes_the_open_chat() {
    let h = harness();
    let alice = h.notifier.join("c-alice", "alice").await;
    let mut bob = h.notifier.join("c-bob", "bob").await;
    h.notifier.chat_opened("alice", "bob").await;
    h.notifier.chat_opened("bob", "alice").await;
    drain(&mut bob);

    drop(alice);
    h.notifier.disconnect("c-alice").await;

    assert_eq!(
        drain(&mut bob),
        vec![
            status("alice", ChatState::Closed, ChatContext::FriendsList),
            status("alice", ChatState::Closed, ChatContext::ChatWindow),
        ]
    );
    assert_eq!(h.presence.open_partner("alice"), None);
    assert!(!h.notifier.is_live("alice").await);
}

#[tokio::test]
async fn disconnect_without_open_chat_is_quiet() {
    let h = harness();
    let alice = h.notifier.join("c-alice", "alice").await;
    let mut bob = h.notifier.join("c-bob", "bob").await;

    drop(alice);
    h.notifier.disconnect("c-alice").await;
    h.notifier.disconnect("never-joined").await;
    assert!(drain(&mut bob).is_empty());
}

#[test]
fn events_serialize_with_type_tag() {
    let json = serde_json::to_value(status("alice", ChatState::Opened, ChatContext::ChatWindow))
        .expect("serialize");
    assert_eq!(
        json,
        serde_json::json!({
            "type": "chat_status",
            "friend_id": "alice",
            "status": "opened",
            "context": "chat_window",
        })
    );

    let json = serde_json::to_value(ServerEvent::UnreadCountsChanged {
        user_id: "bob".into(),
    })
    .expect("serialize");
    assert_eq!(json["type"], "unread_counts_changed");

    let json = serde_json::to_value(ServerEvent::NewMessage {
        message: message("alice", "bob"),
    })
    .expect("serialize");
    assert_eq!(json["type"], "new_message");
    assert_eq!(json["message"]["lifespan"], "3m");
    assert_eq!(json["message"]["is_read"], false);
}
