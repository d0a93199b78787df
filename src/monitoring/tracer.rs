/*!
 * Tracing
 * Subscriber setup and request spans
 *
 * Library code logs through the `log` facade; the subscriber installed
 * here forwards those records (via tracing-log) next to native spans.
 */

use crate::core::types::CorrelationId;
use std::time::{Duration, Instant};
use tracing::{debug, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Requests slower than this are reported at warn level
const SLOW_REQUEST: Duration = Duration::from_millis(500);

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: msgport=info)
/// - MSGPORT_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("msgport=info"));

    let use_json = std::env::var("MSGPORT_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()
    };

    if installed.is_ok() {
        debug!(json = use_json, "tracing initialized");
    }
}

/// Span covering one request/reply exchange
pub struct RequestSpan {
    span: tracing::Span,
    start: Instant,
    correlation_id: CorrelationId,
}

impl RequestSpan {
    pub fn new(correlation_id: CorrelationId, msg_type: u8) -> Self {
        let span = span!(
            Level::DEBUG,
            "request",
            correlation_id = correlation_id,
            msg_type = msg_type,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            correlation_id,
        }
    }

    pub fn record_result(&self, result: &str) {
        self.span.record("result", result);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration > SLOW_REQUEST {
            warn!(
                correlation_id = self.correlation_id,
                duration_ms = duration.as_millis() as u64,
                "slow request"
            );
        } else {
            debug!(correlation_id = self.correlation_id, "request completed");
        }
    }
}
