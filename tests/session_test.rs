//! Group sessions between a server and clients over loopback

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use jamlink::audio::{pcm_format, BitDepth, CodecRegistry};
use jamlink::events::{Event, EventMode, EventQueue};
use jamlink::network::{
    Client, ClientConfig, ClientError, JoinRequest, Server, ServerConfig, ServerError,
    ServerHandle, Sink, SinkConfig, SocketFamily, Source, SourceConfig,
};
use jamlink::time::NtpTime;

struct TestServer {
    handle: ServerHandle,
    port: u16,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let server = Server::bind(
            ServerConfig {
                port: 0,
                family: SocketFamily::Ipv4,
                ..config
            },
            EventMode::Poll { capacity: 1024 },
        )
        .await
        .unwrap();
        let port = server.tcp_addr().port();
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        Self { handle, port, task }
    }

    async fn stop(self) {
        self.handle.stop();
        tokio_test::assert_ok!(self.task.await.unwrap());
    }
}

async fn client() -> (Arc<Client>, JoinHandle<Result<(), ClientError>>) {
    let client = Client::new(
        ClientConfig {
            family: SocketFamily::Ipv4,
            query_timeout: 1.0,
            ..Default::default()
        },
        EventMode::Poll { capacity: 1024 },
    )
    .await
    .unwrap();
    let task = tokio::spawn(client.clone().run());
    (client, task)
}

async fn login(client: &Arc<Client>, port: u16) {
    tokio_test::assert_ok!(client.connect_async("127.0.0.1", port, "", None).await);
}

/// Collect events until one matches, failing after two seconds
async fn wait_for(events: &EventQueue, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
    let mut seen = Vec::new();
    for _ in 0..200 {
        let batch = events.drain();
        let done = batch.iter().any(&pred);
        seen.extend(batch);
        if done {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "event never arrived; saw {:?}",
        seen.iter().map(Event::event_type).collect::<Vec<_>>()
    );
}

fn count(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn test_login_and_public_address() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (alice, task) = client().await;
    login(&alice, server.port).await;

    assert!(alice.is_connected());
    let public = alice.public_address().expect("public address");
    assert_eq!(public.port(), alice.local_addr().port());

    alice.stop();
    task.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_wrong_password_then_retry() {
    let server = TestServer::start(ServerConfig {
        password: Some("secret".to_string()),
        ..Default::default()
    })
    .await;
    let (alice, task) = client().await;

    let result = alice.connect_async("127.0.0.1", server.port, "guess", None).await;
    assert!(matches!(result, Err(ClientError::WrongPassword)));
    assert!(!alice.is_connected());

    tokio_test::assert_ok!(alice.connect_async("127.0.0.1", server.port, "secret", None).await);
    assert!(alice.is_connected());

    alice.stop();
    task.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_peers_meet_and_leave() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (alice, ta) = client().await;
    let (bob, tb) = client().await;
    login(&alice, server.port).await;
    login(&bob, server.port).await;

    let joined = tokio_test::assert_ok!(alice.join_group_async(JoinRequest::new("band", "alice")).await);
    tokio_test::assert_ok!(bob.join_group_async(JoinRequest::new("band", "bob")).await);

    let seen = wait_for(alice.events(), |e| matches!(e, Event::PeerJoin(_))).await;
    assert_eq!(count(&seen, |e| matches!(e, Event::PeerHandshake(_))), 1);
    wait_for(bob.events(), |e| matches!(e, Event::PeerJoin(_))).await;

    let peer = alice.find_peer_by_name("band", "bob").expect("bob is known");
    assert!(peer.connected);
    assert!(!peer.relayed);
    assert_eq!(alice.groups().len(), 1);
    assert_eq!(alice.groups()[0].group_id, joined.group_id);

    // Same name twice is refused
    let (carol, tc) = client().await;
    login(&carol, server.port).await;
    let result = carol.join_group_async(JoinRequest::new("band", "bob")).await;
    assert!(matches!(result, Err(ClientError::UserAlreadyExists)));

    tokio_test::assert_ok!(bob.leave_group_async(joined.group_id).await);
    let seen = wait_for(alice.events(), |e| matches!(e, Event::PeerLeave(_))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = alice.events().drain();
    assert_eq!(
        count(&seen, |e| matches!(e, Event::PeerLeave(_))) + count(&later, |e| matches!(e, Event::PeerLeave(_))),
        1
    );
    assert!(alice.peers().is_empty());
    assert!(bob.groups().is_empty());

    let server_events = server.handle.events().drain();
    assert_eq!(count(&server_events, |e| matches!(e, Event::GroupJoin(_))), 2);
    assert_eq!(count(&server_events, |e| matches!(e, Event::GroupLeave(_))), 1);

    for (client, task) in [(alice, ta), (bob, tb), (carol, tc)] {
        client.stop();
        task.await.unwrap().unwrap();
    }
    server.stop().await;
}

#[tokio::test]
async fn test_lost_client_leaves_group() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (alice, ta) = client().await;
    let (bob, tb) = client().await;
    login(&alice, server.port).await;
    login(&bob, server.port).await;
    tokio_test::assert_ok!(alice.join_group_async(JoinRequest::new("band", "alice")).await);
    tokio_test::assert_ok!(bob.join_group_async(JoinRequest::new("band", "bob")).await);
    wait_for(alice.events(), |e| matches!(e, Event::PeerJoin(_))).await;

    bob.stop();
    tb.await.unwrap().unwrap();

    let seen = wait_for(alice.events(), |e| matches!(e, Event::PeerLeave(_))).await;
    assert_eq!(count(&seen, |e| matches!(e, Event::PeerLeave(_))), 1);

    let stats = tokio_test::assert_ok!(server.handle.stats().await);
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.members, 1);

    alice.stop();
    ta.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_server_messages_and_ejection() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (alice, ta) = client().await;
    let (bob, tb) = client().await;
    login(&alice, server.port).await;
    login(&bob, server.port).await;
    let joined = tokio_test::assert_ok!(alice.join_group_async(JoinRequest::new("band", "alice")).await);
    tokio_test::assert_ok!(bob.join_group_async(JoinRequest::new("band", "bob")).await);
    wait_for(alice.events(), |e| matches!(e, Event::PeerJoin(_))).await;

    // Routed through the server
    tokio_test::assert_ok!(bob.send_message(joined.group_id, None, b"tune up", 0));
    let seen = wait_for(alice.events(), |e| matches!(e, Event::PeerMessage(_))).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::PeerMessage(m) if m.data == b"tune up")));

    tokio_test::assert_ok!(bob.update_user_async(joined.group_id, b"guitar".to_vec()).await);
    wait_for(alice.events(), |e| matches!(e, Event::PeerUpdate(u) if u.metadata == b"guitar")).await;

    tokio_test::assert_ok!(server.handle.remove_group(joined.group_id).await);
    wait_for(alice.events(), |e| matches!(e, Event::GroupEject { .. })).await;
    assert!(alice.groups().is_empty());
    assert!(alice.peers().is_empty());

    for (client, task) in [(alice, ta), (bob, tb)] {
        client.stop();
        task.await.unwrap().unwrap();
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_audio_flows_between_peers() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (alice, ta) = client().await;
    let (bob, tb) = client().await;

    let codecs = Arc::new(CodecRegistry::with_defaults());
    let source = Arc::new(Source::new(0, SourceConfig::default(), codecs.clone(), EventMode::default()));
    source.setup(48000, 256, 1).unwrap();
    source
        .set_format(pcm_format(1, 48000, 256, BitDepth::Float32))
        .unwrap();
    source.start(None).unwrap();
    alice.add_source(source.clone());

    let sink = Arc::new(Sink::new(
        0,
        SinkConfig {
            dynamic_resampling: false,
            ..Default::default()
        },
        codecs,
        EventMode::Poll { capacity: 1024 },
    ));
    sink.setup(48000, 256, 1);
    bob.add_sink(sink.clone());

    login(&alice, server.port).await;
    login(&bob, server.port).await;
    tokio_test::assert_ok!(alice.join_group_async(JoinRequest::new("band", "alice")).await);
    tokio_test::assert_ok!(bob.join_group_async(JoinRequest::new("band", "bob")).await);
    wait_for(alice.events(), |e| matches!(e, Event::PeerJoin(_))).await;
    wait_for(bob.events(), |e| matches!(e, Event::PeerJoin(_))).await;

    let input = vec![0.25f32; 256];
    let mut output = vec![0.0f32; 256];
    let mut t = NtpTime::now();
    let mut started = false;
    for _ in 0..100 {
        source.process(&[input.as_slice()], t);
        sink.process(&mut [output.as_mut_slice()], t);
        started |= sink
            .events()
            .drain()
            .iter()
            .any(|e| matches!(e, Event::StreamStart(_)));
        if started {
            break;
        }
        t = t.add_secs(256.0 / 48000.0);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(started, "bob's sink never saw alice's stream");
    assert!(!sink.sources().is_empty());

    for (client, task) in [(alice, ta), (bob, tb)] {
        client.stop();
        task.await.unwrap().unwrap();
    }
    server.stop().await;
}
