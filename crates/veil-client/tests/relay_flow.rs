//! Two clients talking through a real router over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use veil_client::events::Direction;
use veil_client::{
    Client, ClientConfig, ClientError, ClientEvent, ClientState, MemorySink, MemoryStore,
};
use veil_router::{serve, RouterConfig, RouterContext};
use veil_shared::protocol::{FileInfo, InfoKind};
use veil_shared::{ClientId, RoomId};

async fn start_router() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RouterConfig {
        chunk_size: 1024,
        motd: "welcome".into(),
        ..RouterConfig::default()
    };
    tokio::spawn(serve(listener, RouterContext::new(config)));
    addr
}

fn client_config(router: SocketAddr, name: &str, share: bool) -> ClientConfig {
    ClientConfig {
        router_addr: router,
        name: name.into(),
        share,
        retry_delay: Duration::from_millis(200),
        reverse_ping_delay: Duration::from_millis(50),
        download_poll: Duration::from_millis(10),
        upload_poll: Duration::from_millis(10),
        stall_timeout: Duration::from_secs(10),
        ..ClientConfig::default()
    }
}

/// Skip events until `pick` accepts one.
async fn expect<T>(
    events: &mut mpsc::Receiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("client task stopped");
            if let ClientEvent::TransferFailed { reason, .. } = &event {
                panic!("transfer failed: {reason}");
            }
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until the client has joined and reached `run`; returns its id.
async fn ready(events: &mut mpsc::Receiver<ClientEvent>) -> ClientId {
    let id = expect(events, |e| match e {
        ClientEvent::Joined { client, .. } => Some(client),
        _ => None,
    })
    .await;
    expect(events, |e| (e == ClientEvent::State(ClientState::Run)).then_some(())).await;
    id
}

#[tokio::test]
async fn test_chat_search_browse_and_download() {
    let router = start_router().await;
    let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let store = MemoryStore::new()
        .with_file("notes/plan.txt", content.clone())
        .with_file("readme.md", b"hi".to_vec());

    let (alice, mut alice_events) = Client::spawn(client_config(router, "alice", true), Arc::new(store));
    let alice_id = ready(&mut alice_events).await;

    let (bob, mut bob_events) = Client::spawn(
        client_config(router, "bob", false),
        Arc::new(MemoryStore::new()),
    );
    let bob_id = ready(&mut bob_events).await;

    let joined = expect(&mut alice_events, |e| match e {
        ClientEvent::Member(info) if info.kind == InfoKind::Join => Some(info.member.id),
        _ => None,
    })
    .await;
    assert_eq!(joined, bob_id);

    // Group chat reaches alice tagged with bob as origin.
    bob.chat("hello alice").await.unwrap();
    let (from, text) = expect(&mut alice_events, |e| match e {
        ClientEvent::Chat { from, message, .. } => Some((from, message.text)),
        _ => None,
    })
    .await;
    assert_eq!(from, Some(bob_id));
    assert_eq!(text, "hello alice");

    // From here on alice's events are not inspected.
    tokio::spawn(async move { while alice_events.recv().await.is_some() {} });

    // Search hits come back over bob's tunnel.
    bob.search("PLAN").await.unwrap();
    let (from, files) = expect(&mut bob_events, |e| match e {
        ClientEvent::SearchResult { from, files, .. } => Some((from, files)),
        _ => None,
    })
    .await;
    assert_eq!(from, Some(alice_id));
    assert_eq!(
        files,
        vec![FileInfo {
            path: "notes/plan.txt".into(),
            size: content.len() as u64,
        }]
    );

    let listing = bob.browse(alice_id, "notes").await.unwrap();
    assert_eq!(listing, files);

    // Download the hit through the router.
    let sink = MemorySink::new();
    let transfer = bob
        .download(alice_id, files[0].clone(), Box::new(sink.clone()))
        .await
        .unwrap();
    expect(&mut bob_events, |e| match e {
        ClientEvent::TransferFinished {
            transfer: id,
            direction: Direction::Download,
        } if id == transfer => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(sink.contents().await, content);

    bob.quit().await;
    alice.quit().await;
    assert!(bob.chat("still there?").await.is_err());
}

#[tokio::test]
async fn test_rooms_and_reverse_ping() {
    let router = start_router().await;
    let (carol, mut carol_events) = Client::spawn(
        client_config(router, "carol", false),
        Arc::new(MemoryStore::new()),
    );
    ready(&mut carol_events).await;

    let reverse = carol.ping(true).await.unwrap();
    assert_eq!(reverse.reverse, Some(veil_shared::Status::Ok));

    let lobby = RoomId::new("lobby");
    let joined = carol.join_room(lobby.clone()).await.unwrap();
    assert_eq!(joined.members.len(), 1);

    let rooms = carol.rooms().await.unwrap();
    assert!(rooms.rooms.iter().any(|r| r.id == lobby && r.members == 1));

    carol.chat_room(lobby.clone(), "anyone?").await.unwrap();
    carol.leave_room(lobby).await.unwrap();

    // Whispering to an unknown member is refused; the session survives it.
    let err = carol.whisper(ClientId::random(), "hello?").await.unwrap_err();
    assert!(matches!(err, ClientError::Refused { .. }));
    assert!(carol.ping(false).await.is_ok());
    carol.quit().await;
}
