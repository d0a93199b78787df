/*!
 * IPC Module
 * Envelopes, correlation, receive loops, and the server/client surfaces
 */

pub mod client;
pub mod correlation;
pub mod envelope;
pub mod handler;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod transport;

// Re-export for convenience
pub use client::{Client, Session};
pub use correlation::{Ack, AckMatch, AckTable, CorrelationEngine, LateAck, PendingAck};
pub use envelope::{internal, ControlPayload, Envelope, Features, MessageId, PEER_DEATH_NOTIFICATION};
pub use handler::{ClientHandler, NoopHandler, Reply, ServerHandler};
pub use receiver::{Disposition, EnvelopeSink, ReceiveLoop};
pub use registry::{ClientHandle, ClientRecord, ClientRegistry};
pub use server::Server;
pub use transport::{EndpointLease, LocalBus, Network, ServiceDirectory, Transport};
