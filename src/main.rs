/*!
 * msgport demo
 *
 * Runs an echo server and a couple of clients on an in-process bus:
 * - request/reply round trip
 * - user status codes
 * - broadcast
 * - server-initiated disconnect
 */

use bytes::Bytes;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use msgport::core::errors::set_user_status_formatter;
use msgport::{
    init_tracing, Client, ClientHandle, ClientHandler, IpcConfig, LocalBus, Network, Reply, Server,
    ServerHandler, StatusCode,
};

const SERVICE: &str = "echo";

const MSG_ECHO: u8 = 1;
const MSG_UPPER: u8 = 2;
const MSG_NEWS: u8 = 10;

const STATUS_NOT_TEXT: StatusCode = StatusCode::user(1);

struct EchoServer;

impl ServerHandler for EchoServer {
    fn on_client_connected(&self, client: ClientHandle) {
        info!(%client, "client joined");
    }

    fn on_client_disconnected(&self, client: ClientHandle) {
        info!(%client, "client left");
    }

    fn on_message_with_reply(&self, _client: ClientHandle, msg_type: u8, payload: Bytes) -> Reply {
        match msg_type {
            MSG_ECHO => Reply::ok(payload),
            MSG_UPPER => match std::str::from_utf8(&payload) {
                Ok(text) => Reply::ok(text.to_uppercase()),
                Err(_) => Reply::status(STATUS_NOT_TEXT),
            },
            _ => Reply::status(StatusCode::INVALID_PARAM),
        }
    }
}

struct Listener {
    name: &'static str,
}

impl ClientHandler for Listener {
    fn on_connected(&self, client_id: u32) {
        info!(listener = self.name, client_id, "connected");
    }

    fn on_disconnected(&self) {
        info!(listener = self.name, "session ended");
    }

    fn on_message(&self, msg_type: u8, payload: Bytes) {
        info!(
            listener = self.name,
            msg_type,
            text = %String::from_utf8_lossy(&payload),
            "push received"
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    set_user_status_formatter(|code| (code == STATUS_NOT_TEXT).then(|| "payload is not UTF-8".to_string()));

    let config = IpcConfig::from_env().with_receive_poll(Duration::from_millis(50));
    let bus: Arc<dyn Network> = Arc::new(LocalBus::new());

    let server = Server::create(SERVICE, EchoServer, bus.clone(), config)?;
    server.start()?;
    info!(endpoint = server.endpoint(), "server '{}' listening", SERVICE);

    let alice = Client::connect_to(SERVICE, "alice", Listener { name: "alice" }, bus.clone(), config)?;
    let bob = Client::connect_to(SERVICE, "bob", Listener { name: "bob" }, bus.clone(), config)?;

    let timeout = Duration::from_secs(2);
    let reply = alice.send_with_reply(MSG_ECHO, "ping", timeout)?;
    info!(status = %reply.status, payload = %String::from_utf8_lossy(&reply.payload), "echo");

    let reply = bob.send_with_reply(MSG_UPPER, "hello", timeout)?;
    info!(status = %reply.status, payload = %String::from_utf8_lossy(&reply.payload), "upper");

    let reply = bob.send_with_reply(MSG_UPPER, vec![0xff, 0xfe], timeout)?;
    if !reply.status.is_success() {
        warn!(status = %reply.status, "request rejected");
    }

    let delivered = server.broadcast(MSG_NEWS, "server news")?;
    info!(delivered, "broadcast sent");

    if let Some(id) = bob.client_id() {
        if let Some(handle) = server.clients().into_iter().find(|c| c.id == id) {
            server.disconnect_client(handle)?;
        }
    }
    std::thread::sleep(Duration::from_millis(100));
    info!(bob_connected = bob.is_connected(), clients = server.client_count(), "after disconnect");

    alice.disconnect()?;
    std::thread::sleep(Duration::from_millis(100));

    let stats = server.stats();
    info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        late = stats.late_acks,
        "server counters"
    );

    drop(alice);
    drop(bob);
    server.shutdown();
    info!("done");
    Ok(())
}
