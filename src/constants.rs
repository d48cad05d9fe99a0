use std::time::Duration;

use tracing::Level;

// Wire header: 1 byte version+flags, seq_nr, ack_nr, cumulative_ack (u64 each), wnd (u32).
pub const SWP_HEADER: usize = 1 + 8 + 8 + 8 + 4;
pub const SWP_VERSION: u8 = 1;

// Inbox names are length-prefixed with a single byte on the wire.
pub const MAX_INBOX_LEN: usize = u8::MAX as usize;

// EWMA smoothing factor for the RTT estimate.
pub const DEFAULT_RTT_ALPHA: f64 = 0.1;

// Used as the RTT spread until the first sample arrives, so the first
// packets don't time out before anything was measured.
pub const RTT_DEFAULT_SD: Duration = Duration::from_millis(10);

// RTO = estimate + k * sd.
pub const DEFAULT_TIMEOUT_MULTIPLIER: f64 = 4.0;

pub const DEFAULT_MIN_RTO: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_RTO: Duration = Duration::from_secs(10);

// Each retransmission of the same packet doubles its RTO up to this many times.
pub const DEFAULT_MAX_BACKOFF_DOUBLINGS: u32 = 6;

// How many packets can be in flight (sent and unacked) per session.
pub const DEFAULT_MAX_WINDOW: usize = 64;

pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);

pub const RTT_TRACING_LOG_LEVEL: Level = Level::TRACE;
