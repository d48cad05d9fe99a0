//! Reliable, ordered packet delivery over a best-effort network using a
//! sliding window with per-packet retransmission timers.
//!
//! Each [`Session`] talks to one peer. Outgoing packets get sequence numbers
//! and stay scheduled in a [`RetryQueue`] until acknowledged. The timeout is
//! derived from an [`RttEstimator`] and backs off on repeated loss. Incoming
//! packets are put back in order before being handed to the user.

mod constants;
mod error;
mod message;
mod metrics;
#[cfg(feature = "nats")]
mod nats_net;
pub mod raw;
mod receiver;
mod retry_queue;
mod rtt;
mod sender;
mod seq_nr;
mod session;
mod session_dispatch;
mod sim_net;
mod spawn_utils;
mod traits;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use message::Packet;
#[cfg(feature = "nats")]
pub use nats_net::{CertConfig, NatsClientConfig, NatsNet};
pub use retry_queue::{Deadline, RetryQueue};
pub use rtt::RttEstimator;
pub use sender::PacketState;
pub use seq_nr::Seqno;
pub use session::{Session, SessionOpts, SessionStats};
pub use sim_net::{SentRecord, SimNet, SimNetOpts, SimNetStats};
pub use traits::{DefaultSwpEnvironment, NetEvent, Network, SwpEnvironment};

pub type Payload = Vec<u8>;
