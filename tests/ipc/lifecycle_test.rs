/*!
 * Lifecycle Tests
 *
 * Connect/disconnect notifications, peer death, capacity limits and
 * server-initiated traffic.
 */

use bytes::Bytes;
use msgport::core::errors::{clear_user_status_formatter, set_user_status_formatter};
use msgport::ipc::correlation::CorrelationEngine;
use msgport::core::types::EndpointId;
use msgport::ipc::envelope::{internal, ControlPayload, Envelope};
use msgport::ipc::transport::{ServiceDirectory, Transport};
use msgport::monitoring::ProtocolStats;
use msgport::{
    Client, ClientHandle, ClientHandler, IpcConfig, IpcError, IpcResult, LocalBus, Network,
    NoopHandler, Reply, Server, ServerHandler, StatusCode,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connected(ClientHandle),
    Disconnected(ClientHandle),
}

struct Journal(Arc<Mutex<Vec<Event>>>);

impl ServerHandler for Journal {
    fn on_client_connected(&self, client: ClientHandle) {
        self.0.lock().push(Event::Connected(client));
    }

    fn on_client_disconnected(&self, client: ClientHandle) {
        self.0.lock().push(Event::Disconnected(client));
    }
}

#[derive(Default)]
struct SessionFlags {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

struct Watcher(Arc<SessionFlags>);

impl ClientHandler for Watcher {
    fn on_connected(&self, _client_id: u32) {
        self.0.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.0.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message_with_reply(&self, msg_type: u8, payload: Bytes) -> Reply {
        let mut answer = payload.to_vec();
        answer.push(msg_type);
        Reply::ok(answer)
    }
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

fn bus() -> Arc<dyn Network> {
    Arc::new(LocalBus::new())
}

#[test]
fn test_connect_and_disconnect_notifications() {
    let network = bus();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let server = Server::create("journal", Journal(journal.clone()), network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let flags = Arc::new(SessionFlags::default());
    let client = Client::connect_to("journal", "c", Watcher(flags.clone()), network, IpcConfig::responsive()).unwrap();
    let handle = ClientHandle {
        id: client.client_id().unwrap(),
        slot: client.session().unwrap().slot,
    };
    assert_eq!(handle.id, 1);

    client.disconnect().unwrap();
    assert!(!client.is_connected());
    assert!(matches!(client.disconnect(), Err(IpcError::NotConnected(_))));

    assert!(wait_until(Duration::from_secs(1), || journal.lock().len() == 2));
    assert_eq!(
        *journal.lock(),
        vec![Event::Connected(handle), Event::Disconnected(handle)]
    );
    assert!(wait_until(Duration::from_secs(1), || {
        flags.disconnected.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(flags.connected.load(Ordering::SeqCst), 1);
    assert_eq!(server.client_count(), 0);
}

#[test]
fn test_dropped_client_is_removed() {
    let network = bus();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let server = Server::create("drops", Journal(journal.clone()), network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let client = Client::connect_to("drops", "short-lived", NoopHandler, network, IpcConfig::responsive()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));
    drop(client);

    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 0));
    assert!(wait_until(Duration::from_secs(1), || {
        matches!(journal.lock().last(), Some(Event::Disconnected(_)))
    }));
}

#[test]
fn test_client_table_full() {
    let network = bus();
    let server = Server::create(
        "tiny",
        NoopHandler,
        network.clone(),
        IpcConfig::responsive().with_max_clients(1),
    )
    .unwrap();
    server.start().unwrap();

    let _first = Client::connect_to("tiny", "first", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    let second = Client::create("second", NoopHandler, network, IpcConfig::responsive()).unwrap();
    let err = second.connect("tiny").unwrap_err();

    assert_eq!(err.status(), StatusCode::CLIENT_FULL);
    assert!(!second.is_connected());
    assert_eq!(server.client_count(), 1);
}

#[test]
fn test_connect_to_unknown_service() {
    let client = Client::create("lost", NoopHandler, bus(), IpcConfig::responsive()).unwrap();
    assert!(matches!(client.connect("nobody"), Err(IpcError::NotConnected(_))));
    assert!(matches!(client.send(1, "x"), Err(IpcError::NotConnected(_))));
}

#[test]
fn test_server_shutdown_ends_client_session() {
    let network = bus();
    let server = Server::create("mortal", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let flags = Arc::new(SessionFlags::default());
    let client = Client::connect_to("mortal", "survivor", Watcher(flags.clone()), network, IpcConfig::responsive()).unwrap();

    server.shutdown();
    server.shutdown();

    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()));
    assert!(wait_until(Duration::from_secs(1), || {
        flags.disconnected.load(Ordering::SeqCst) == 1
    }));
    assert!(matches!(
        client.send_with_reply(1, "hello", Duration::from_millis(200)),
        Err(IpcError::NotConnected(_))
    ));
}

#[test]
fn test_server_death_aborts_blocked_request() {
    let bus = Arc::new(LocalBus::new());
    let network: Arc<dyn Network> = bus.clone();
    let server_ep = bus.check_in("silent").unwrap();
    let accepted = Arc::new(AtomicBool::new(false));

    // Accepts the handshake, then never answers
    let fake_server = {
        let bus = bus.clone();
        let accepted = accepted.clone();
        thread::spawn(move || {
            let engine = CorrelationEngine::new(
                bus.clone(),
                server_ep,
                4,
                Duration::from_millis(100),
                Arc::new(ProtocolStats::new()),
            );
            while let Ok(Some(envelope)) = bus.receive(server_ep, Duration::from_secs(2)) {
                let control = envelope.control().unwrap();
                if envelope.id.is_internal() && envelope.id.message_type() == internal::CONNECT {
                    let assigned = ControlPayload { client_id: 42, ..control };
                    engine
                        .send_ack(
                            envelope.reply_to.unwrap(),
                            envelope.id,
                            &assigned,
                            StatusCode::SUCCESS,
                            Bytes::new(),
                        )
                        .unwrap();
                    accepted.store(true, Ordering::SeqCst);
                }
            }
        })
    };

    let flags = Arc::new(SessionFlags::default());
    let client = Client::connect_to("silent", "hopeful", Watcher(flags.clone()), network, IpcConfig::responsive()).unwrap();
    assert_eq!(client.client_id(), Some(42));
    assert!(wait_until(Duration::from_secs(1), || accepted.load(Ordering::SeqCst)));

    let killer = {
        let bus = bus.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            bus.release_endpoint(server_ep);
        })
    };

    let start = Instant::now();
    let err = client
        .send_with_reply(5, "anyone?", Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, IpcError::NotConnected(_)));
    assert!(start.elapsed() < Duration::from_secs(2));

    killer.join().unwrap();
    fake_server.join().unwrap();
    assert!(!client.is_connected());
    assert!(wait_until(Duration::from_secs(1), || {
        flags.disconnected.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn test_server_request_to_client() {
    let network = bus();
    let server = Server::create("asker", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let client = Client::connect_to(
        "asker",
        "answerer",
        Watcher(Arc::new(SessionFlags::default())),
        network,
        IpcConfig::responsive(),
    )
    .unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));
    let handle = server.clients()[0];
    assert_eq!(Some(handle.id), client.client_id());

    let reply = server
        .send_with_reply(handle, 8, "abc", Duration::from_secs(2))
        .unwrap();
    assert_eq!(reply.status, StatusCode::SUCCESS);
    assert_eq!(reply.payload, Bytes::from_static(b"abc\x08"));
}

#[test]
fn test_server_initiated_disconnect() {
    let network = bus();
    let server = Server::create("bouncer", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();

    let flags = Arc::new(SessionFlags::default());
    let client = Client::connect_to("bouncer", "guest", Watcher(flags.clone()), network, IpcConfig::responsive()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));
    let handle = server.clients()[0];

    server.disconnect_client(handle).unwrap();
    assert!(!server.is_connected(handle));
    assert!(matches!(server.send(handle, 1, "late"), Err(IpcError::NotConnected(_))));
    assert!(matches!(server.disconnect_client(handle), Err(IpcError::NotConnected(_))));

    assert!(wait_until(Duration::from_secs(1), || !client.is_connected()));
    assert!(wait_until(Duration::from_secs(1), || {
        flags.disconnected.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn test_stale_handle_rejected_after_reconnect() {
    let network = bus();
    let server = Server::create(
        "reuse",
        NoopHandler,
        network.clone(),
        IpcConfig::responsive().with_max_clients(1),
    )
    .unwrap();
    server.start().unwrap();

    let client = Client::connect_to("reuse", "first", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));
    let old = server.clients()[0];
    drop(client);
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 0));

    let _again = Client::connect_to("reuse", "second", NoopHandler, network, IpcConfig::responsive()).unwrap();
    let new = server.clients()[0];
    assert_eq!(new.slot, old.slot);
    assert_ne!(new.id, old.id);
    assert!(matches!(server.send(old, 1, "stale"), Err(IpcError::NotConnected(_))));
    assert!(server.send(new, 1, "fresh").is_ok());
}

#[test]
fn test_user_status_formatter() {
    set_user_status_formatter(|code| match code.0 - StatusCode::USER_BASE {
        12 => Some("quota exceeded".to_string()),
        _ => None,
    });
    assert_eq!(StatusCode::user(12).to_string(), "quota exceeded");
    assert_eq!(StatusCode::user(13).to_string(), "user status 13");
    assert_eq!(StatusCode::TIMEOUT.to_string(), "timeout");
    clear_user_status_formatter();
    assert_eq!(StatusCode::user(12).to_string(), "user status 12");
}

#[test]
fn test_duplicate_service_name_rejected() {
    let network = bus();
    let _server = Server::create("unique", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    assert!(Server::create("unique", NoopHandler, network, IpcConfig::responsive()).is_err());
}

#[test]
fn test_server_restarts_within_tracker_capacity() {
    let network = bus();
    let server = Server::create(
        "restartable",
        NoopHandler,
        network.clone(),
        IpcConfig::responsive().with_max_resources(4),
    )
    .unwrap();

    for _ in 0..10 {
        server.start().unwrap();
        assert!(server.is_running());
        server.stop();
        assert!(!server.is_running());
    }

    server.start().unwrap();
    let client = Client::connect_to("restartable", "after-restarts", NoopHandler, network, IpcConfig::responsive()).unwrap();
    assert!(client.is_connected());
}

/// Bus that refuses death watches on one endpoint
struct NoWatch {
    bus: LocalBus,
    refused: Mutex<Option<EndpointId>>,
}

impl Transport for NoWatch {
    fn allocate_endpoint(&self) -> IpcResult<EndpointId> {
        self.bus.allocate_endpoint()
    }

    fn send(&self, destination: EndpointId, envelope: Envelope, timeout: Duration) -> IpcResult<()> {
        self.bus.send(destination, envelope, timeout)
    }

    fn receive(&self, local: EndpointId, timeout: Duration) -> IpcResult<Option<Envelope>> {
        self.bus.receive(local, timeout)
    }

    fn request_death_notification(&self, watched: EndpointId, notify: EndpointId) -> IpcResult<()> {
        if *self.refused.lock() == Some(watched) {
            return Err(IpcError::NotConnected(format!("endpoint {} refused", watched)));
        }
        self.bus.request_death_notification(watched, notify)
    }

    fn release_endpoint(&self, endpoint: EndpointId) {
        self.bus.release_endpoint(endpoint)
    }

    fn is_alive(&self, endpoint: EndpointId) -> bool {
        self.bus.is_alive(endpoint)
    }
}

impl ServiceDirectory for NoWatch {
    fn check_in(&self, name: &str) -> IpcResult<EndpointId> {
        self.bus.check_in(name)
    }

    fn lookup(&self, name: &str) -> IpcResult<EndpointId> {
        self.bus.lookup(name)
    }
}

#[test]
fn test_failed_death_watch_leaves_no_registration() {
    let network = Arc::new(NoWatch {
        bus: LocalBus::new(),
        refused: Mutex::new(None),
    });
    let server = Server::create("guarded", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    server.start().unwrap();
    *network.refused.lock() = Some(server.endpoint());

    let client = Client::create("unwatched", NoopHandler, network.clone(), IpcConfig::responsive()).unwrap();
    assert!(matches!(client.connect("guarded"), Err(IpcError::NotConnected(_))));
    assert!(!client.is_connected());
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 0));

    *network.refused.lock() = None;
    client.connect("guarded").unwrap();
    assert!(wait_until(Duration::from_secs(1), || server.client_count() == 1));
}
