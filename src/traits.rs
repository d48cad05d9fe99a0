use std::future::Future;

use tokio::{sync::mpsc::UnboundedReceiver, time::Instant};

use crate::{error::Result, message::Packet};

/// Asynchronous notifications from the underlying transport. They are delivered
/// on a channel instead of failing whatever operation happens to be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Connected,
    Disconnected,
    Reconnected,
    Closed,
    /// An asynchronous transport error. If `fatal` is set, the session that
    /// observes it terminates.
    AsyncError { error: String, fatal: bool },
}

/// The best-effort packet network sessions run on top of.
///
/// Nothing is promised about delivery: packets can be lost, duplicated and
/// reordered.
pub trait Network: Send + Sync + 'static {
    /// Send and pray. `reason` is only used for diagnostics.
    fn send<'a>(
        &'a self,
        packet: &'a Packet,
        reason: &'static str,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Start receiving packets addressed to `inbox`. The stream ends when the
    /// inbox is closed and can't be restarted.
    fn listen<'a>(
        &'a self,
        inbox: &'a str,
    ) -> impl Future<Output = Result<UnboundedReceiver<Packet>>> + Send + 'a;

    /// Transport notifications, if the network produces any.
    fn subscribe_events(&self) -> Option<UnboundedReceiver<NetEvent>> {
        None
    }
}

impl<N: Network> Network for std::sync::Arc<N> {
    fn send<'a>(
        &'a self,
        packet: &'a Packet,
        reason: &'static str,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        N::send(self, packet, reason)
    }

    fn listen<'a>(
        &'a self,
        inbox: &'a str,
    ) -> impl Future<Output = Result<UnboundedReceiver<Packet>>> + Send + 'a {
        N::listen(self, inbox)
    }

    fn subscribe_events(&self) -> Option<UnboundedReceiver<NetEvent>> {
        N::subscribe_events(self)
    }
}

// A trait for mocking the clock in tests.
pub trait SwpEnvironment: Send + Sync + Unpin + 'static {
    fn now(&self) -> Instant;
}

#[derive(Default, Clone, Copy)]
pub struct DefaultSwpEnvironment {}

impl SwpEnvironment for DefaultSwpEnvironment {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
