use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use murmur_client::{ClientConfig, Session};
use murmur_net::{LocalBus, PeerEvent, PeerState, PeerStatus};
use murmur_shared::{ChatId, Message};
use murmur_store::MemoryStore;

fn config(username: &str) -> ClientConfig {
    ClientConfig {
        username: username.to_string(),
        presence_interval: Duration::from_secs(1),
        peer_ttl: Duration::from_secs(3),
        ..ClientConfig::default()
    }
}

async fn start(username: &str, bus: &LocalBus) -> Session {
    Session::start(config(username), Arc::new(MemoryStore::new()), bus.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_direct_message_between_sessions() {
    let bus = LocalBus::default();
    let alice = start("alice", &bus).await;
    let bob = start("bob", &bus).await;

    alice.router().add_contact(bob.identity().clone()).await.unwrap();
    bob.router().add_contact(alice.identity().clone()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    bob.router().on_message(move |m: &Message| {
        let _ = tx.send(m.clone());
    });

    let sent = alice
        .router()
        .send_direct_message(&bob.identity().id, "hello over the bus")
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message not delivered in time")
        .unwrap();
    assert_eq!(received.id, sent.id);
    assert_eq!(received.plaintext, "hello over the bus");
    assert_eq!(received.sender_id, alice.identity().id);

    let history = bob
        .router()
        .messages_for_chat(&ChatId::Direct(alice.identity().id))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_peer_discovery_between_sessions() {
    let bus = LocalBus::default();
    let alice = start("alice", &bus).await;

    // Subscribe before bob starts so his first announcement is seen.
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerEvent>();
    alice.router().on_peer_status(move |e: &PeerEvent| {
        let _ = tx.send(e.clone());
    });

    let bob = start("bob", &bus).await;
    let bob_id = bob.identity().id;

    let event = timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.peer_id == bob_id && event.status == PeerStatus::Connected {
                return event;
            }
        }
    })
    .await
    .expect("bob was never discovered");

    assert_eq!(
        event.identity.map(|identity| identity.username),
        Some("bob".to_string())
    );
    // Presence alone never reports a transport-level connection.
    let known = alice.transport().known_peers().await;
    let record = known
        .iter()
        .find(|record| record.id == bob_id)
        .expect("bob in registry");
    assert_eq!(record.state, PeerState::Discovered);
    assert!(!alice.transport().connected_peers().await.contains(&bob_id));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_message_from_stranger_dropped() {
    let bus = LocalBus::default();
    let alice = start("alice", &bus).await;
    let bob = start("bob", &bus).await;

    // Bob knows Alice, Alice does not know Bob.
    bob.router().add_contact(alice.identity().clone()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    alice.router().on_message(move |m: &Message| {
        let _ = tx.send(m.clone());
    });

    bob.router()
        .send_direct_message(&alice.identity().id, "you don't know me")
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());

    alice.shutdown().await;
    bob.shutdown().await;
}
