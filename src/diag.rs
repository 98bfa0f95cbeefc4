//! Diagnostic channel names, used as `tracing` targets.
//!
//! Subscribers can filter on these targets to follow one aspect of the
//! library: `action` (operations the application asked for), `events`
//! (things the wire did), `errors`, `server` (raw statement traffic), and
//! `status` (cluster readiness transitions).

/// Application-initiated operations: connect, request, subscribe, teardown.
pub const ACTION: &str = "amberline::action";

/// Wire-level happenings: negotiated versions, notifications, closures.
pub const EVENTS: &str = "amberline::events";

/// Transport and routing failures.
pub const ERRORS: &str = "amberline::errors";

/// Raw statement traffic, both directions.
pub const SERVER: &str = "amberline::server";

/// Cluster readiness transitions and per-server up/down edges.
pub const STATUS: &str = "amberline::status";
