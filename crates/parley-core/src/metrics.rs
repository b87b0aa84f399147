//! Client instrumentation.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const FRAMES_TOTAL: &str = "parley_frames_total";
    pub const BYTES_TOTAL: &str = "parley_bytes_total";
    pub const CONNECTS_TOTAL: &str = "parley_connect_attempts_total";
    pub const RECONNECTS_TOTAL: &str = "parley_reconnects_total";
    pub const CONNECTED: &str = "parley_connected";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "parley_subscriptions_active";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames sent and received");
    metrics::describe_counter!(names::BYTES_TOTAL, "Bytes sent and received");
    metrics::describe_counter!(names::CONNECTS_TOTAL, "Transport open attempts");
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Scheduled reconnects");
    metrics::describe_gauge!(names::CONNECTED, "1 while a session is established");
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Bound conversation topics");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Application messages by direction");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Faults by kind");
}

/// Record a frame.
pub fn record_frame(packet: &'static str, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "packet" => packet, "direction" => direction).increment(1);
}

/// Record stream bytes.
pub fn record_bytes(len: usize, direction: &'static str) {
    counter!(names::BYTES_TOTAL, "direction" => direction).increment(len as u64);
}

/// Record a transport open.
pub fn record_connect_attempt() {
    counter!(names::CONNECTS_TOTAL).increment(1);
}

/// Record a scheduled reconnect.
pub fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

/// Update the connected gauge.
pub fn set_connected(connected: bool) {
    gauge!(names::CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

/// Update the subscription gauge.
pub fn set_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}

/// Record an application message.
pub fn record_message(kind: &'static str, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "type" => kind, "direction" => direction).increment(1);
}

/// Record a fault.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}
