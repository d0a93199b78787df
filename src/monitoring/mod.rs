/*!
 * Monitoring
 * Tracing setup and protocol counters
 */

pub mod metrics;
pub mod tracer;

pub use metrics::{ProtocolStats, StatsSnapshot};
pub use tracer::{init_tracing, RequestSpan};
