/*!
 * End-to-End Tests
 *
 * Server and clients on an in-process bus.
 */

use bytes::Bytes;
use msgport::{
    Client, ClientHandle, ClientHandler, IpcConfig, IpcError, LocalBus, Network, NoopHandler,
    Reply, Server, ServerHandler, StatusCode,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

const ECHO: u8 = 1;
const SLOW: u8 = 2;
const REJECT: u8 = 3;
const NEWS: u8 = 9;

struct EchoServer {
    late_replies: Arc<AtomicUsize>,
}

impl ServerHandler for EchoServer {
    fn on_message_with_reply(&self, _client: ClientHandle, msg_type: u8, payload: Bytes) -> Reply {
        match msg_type {
            ECHO => Reply::ok(payload),
            SLOW => {
                thread::sleep(Duration::from_millis(3000));
                Reply::ok(payload)
            }
            REJECT => Reply::with_status(payload, StatusCode::user(7)),
            _ => Reply::status(StatusCode::INVALID_PARAM),
        }
    }

    fn on_late_reply(&self, _correlation_id: u64, _reply: Reply) {
        self.late_replies.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Inbox {
    messages: Mutex<Vec<(u8, Bytes)>>,
    late_replies: AtomicUsize,
}

struct Recorder(Arc<Inbox>);

impl ClientHandler for Recorder {
    fn on_message(&self, msg_type: u8, payload: Bytes) {
        self.0.messages.lock().push((msg_type, payload));
    }

    fn on_late_reply(&self, _correlation_id: u64, _reply: Reply) {
        self.0.late_replies.fetch_add(1, Ordering::SeqCst);
    }
}

fn setup(service: &str) -> (Arc<dyn Network>, Server) {
    let network: Arc<dyn Network> = Arc::new(LocalBus::new());
    let server = Server::create(
        service,
        EchoServer {
            late_replies: Arc::new(AtomicUsize::new(0)),
        },
        network.clone(),
        IpcConfig::responsive(),
    )
    .unwrap();
    server.start().unwrap();
    (network, server)
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_echo_round_trip() {
    let (network, server) = setup("echo");
    let client = Client::connect_to("echo", "c1", NoopHandler, network, IpcConfig::responsive()).unwrap();

    assert!(client.is_connected());
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));

    let reply = client
        .send_with_reply(ECHO, "ping", Duration::from_millis(2000))
        .unwrap();
    assert_eq!(reply.status, StatusCode::SUCCESS);
    assert_eq!(reply.payload, Bytes::from_static(b"ping"));

    let stats = client.stats();
    assert_eq!(stats.acks_matched, 2);
    assert_eq!(stats.timeouts, 0);
}

#[test]
fn test_timeout_then_next_request_succeeds() {
    let (network, _server) = setup("slow");
    let inbox = Arc::new(Inbox::default());
    let client = Client::connect_to(
        "slow",
        "impatient",
        Recorder(inbox.clone()),
        network,
        IpcConfig::responsive(),
    )
    .unwrap();

    let start = Instant::now();
    let err = client
        .send_with_reply(SLOW, "zzz", Duration::from_millis(2000))
        .unwrap_err();
    assert!(matches!(err, IpcError::Timeout { timeout_ms: 2000, .. }));
    assert!(start.elapsed() >= Duration::from_millis(2000));

    // Queued behind the slow handler, well inside its own timeout
    let reply = client
        .send_with_reply(ECHO, "after", Duration::from_millis(2000))
        .unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"after"));

    assert!(wait_until(Duration::from_secs(1), || {
        inbox.late_replies.load(Ordering::SeqCst) == 1
    }));
    let stats = client.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.discarded_acks(), 1);
}

#[test]
fn test_user_status_comes_back_in_reply() {
    let (network, _server) = setup("status");
    let client = Client::connect_to("status", "c", NoopHandler, network, IpcConfig::responsive()).unwrap();

    let reply = client
        .send_with_reply(REJECT, "payload", Duration::from_secs(2))
        .unwrap();
    assert_eq!(reply.status, StatusCode::user(7));
    assert!(reply.status.is_user());
    assert_eq!(reply.payload, Bytes::from_static(b"payload"));

    let reply = client.send_with_reply(77, "", Duration::from_secs(2)).unwrap();
    assert_eq!(reply.status, StatusCode::INVALID_PARAM);
}

#[test]
fn test_broadcast_survives_concurrent_disconnect() {
    let (network, server) = setup("news");
    let inboxes: Vec<Arc<Inbox>> = (0..5).map(|_| Arc::new(Inbox::default())).collect();
    let mut clients: Vec<Client> = inboxes
        .iter()
        .enumerate()
        .map(|(i, inbox)| {
            Client::connect_to(
                "news",
                &format!("reader-{}", i),
                Recorder(inbox.clone()),
                network.clone(),
                IpcConfig::responsive(),
            )
            .unwrap()
        })
        .collect();
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 5));

    let leaver = clients.remove(0);
    let leaving = thread::spawn(move || {
        leaver.disconnect().unwrap();
        leaver
    });
    let delivered = server.broadcast(NEWS, "headline").unwrap();
    let leaver = leaving.join().unwrap();
    assert!(delivered >= 4);

    for inbox in &inboxes[1..] {
        assert!(wait_until(Duration::from_secs(1), || inbox.messages.lock().len() == 1));
        assert_eq!(
            inbox.messages.lock()[0],
            (NEWS, Bytes::from_static(b"headline"))
        );
    }
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 4));
    drop(leaver);
}

#[test]
fn test_per_client_order_is_preserved() {
    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl ServerHandler for Collect {
        fn on_message(&self, _client: ClientHandle, _msg_type: u8, payload: Bytes) {
            self.0.lock().push(payload[0]);
        }
    }

    let network: Arc<dyn Network> = Arc::new(LocalBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = Server::create("ordered", Collect(seen.clone()), network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let client = Client::connect_to("ordered", "sender", NoopHandler, network, IpcConfig::responsive()).unwrap();
    for i in 0..100u8 {
        client.send(ECHO, vec![i]).unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 100));
    assert_eq!(*seen.lock(), (0..100u8).collect::<Vec<_>>());
}

#[test]
fn test_missing_reply_handler_answers_internal() {
    let network: Arc<dyn Network> = Arc::new(LocalBus::new());
    let server = Server::create("mute", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let client = Client::connect_to("mute", "asker", NoopHandler, network, IpcConfig::responsive()).unwrap();
    let reply = client.send_with_reply(ECHO, "?", Duration::from_secs(2)).unwrap();
    assert_eq!(reply.status, StatusCode::INTERNAL);
    assert!(reply.payload.is_empty());
}

#[test]
fn test_push_from_connect_callback_arrives_after_on_connected() {
    struct Greeter(Arc<Mutex<Option<Weak<Server>>>>);

    impl ServerHandler for Greeter {
        fn on_client_connected(&self, client: ClientHandle) {
            let server = self.0.lock().as_ref().and_then(Weak::upgrade);
            if let Some(server) = server {
                server.send(client, NEWS, "welcome").unwrap();
            }
        }
    }

    struct Timeline(Arc<Mutex<Vec<String>>>);

    impl ClientHandler for Timeline {
        fn on_connected(&self, _client_id: u32) {
            self.0.lock().push("connected".to_string());
        }

        fn on_message(&self, msg_type: u8, payload: Bytes) {
            let text = String::from_utf8_lossy(&payload);
            self.0.lock().push(format!("{}:{}", msg_type, text));
        }
    }

    let network: Arc<dyn Network> = Arc::new(LocalBus::new());
    let slot = Arc::new(Mutex::new(None));
    let server = Arc::new(
        Server::create("greeter", Greeter(slot.clone()), network.clone(), IpcConfig::responsive()).unwrap(),
    );
    *slot.lock() = Some(Arc::downgrade(&server));
    server.start().unwrap();

    let timelines: Vec<Arc<Mutex<Vec<String>>>> = (0..20).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    let clients: Vec<Client> = timelines
        .iter()
        .enumerate()
        .map(|(i, timeline)| {
            Client::connect_to(
                "greeter",
                &format!("guest-{}", i),
                Timeline(timeline.clone()),
                network.clone(),
                IpcConfig::responsive(),
            )
            .unwrap()
        })
        .collect();

    for timeline in &timelines {
        assert!(wait_until(Duration::from_secs(2), || timeline.lock().len() == 2));
        assert_eq!(*timeline.lock(), vec!["connected".to_string(), format!("{}:welcome", NEWS)]);
    }
    for client in &clients {
        assert_eq!(client.stats().protocol_violations, 0);
    }
    drop(clients);
    server.shutdown();
}

#[test]
fn test_concurrent_connect_is_rejected() {
    let (network, server) = setup("single");
    let client = Arc::new(Client::create("eager", NoopHandler, network, IpcConfig::responsive()).unwrap());

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.connect("single"))
        })
        .collect();
    let results: Vec<_> = attempts.into_iter().map(|a| a.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, IpcError::InvalidParam(_))));
    assert!(client.is_connected());
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));
}

#[test]
fn test_request_with_unbounded_timeout() {
    let (network, _server) = setup("patient");
    let client = Client::connect_to("patient", "c", NoopHandler, network, IpcConfig::responsive()).unwrap();

    let reply = client.send_with_reply(ECHO, "forever", Duration::MAX).unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"forever"));
}
