use std::time::Duration;

use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot, watch,
};
use tokio_util::sync::CancellationToken;
use tracing::error_span;

use crate::{
    Payload,
    constants::{
        DEFAULT_MAX_BACKOFF_DOUBLINGS, DEFAULT_MAX_RTO, DEFAULT_MAX_WINDOW, DEFAULT_MIN_RTO,
        DEFAULT_RTT_ALPHA, DEFAULT_TIMEOUT_MULTIPLIER, MAX_INBOX_LEN,
    },
    error::{Error, Result},
    message::Packet,
    sender::{PacketState, RetransmitPolicy},
    seq_nr::Seqno,
    session_dispatch::{Command, SessionDispatcher},
    spawn_utils::spawn_with_cancel,
    traits::{NetEvent, Network, SwpEnvironment},
};

#[derive(Debug, Default, Clone)]
pub struct SessionOpts {
    /// Used in logs. Defaults to the inbox.
    pub node_name: Option<String>,

    /// Address this session listens on.
    pub inbox: String,

    /// Address of the peer session.
    pub remote: String,

    /// How many packets can be in flight before submit() starts waiting. Also
    /// how many out-of-order packets the receiving side buffers.
    pub max_window: Option<usize>,

    /// k in "RTO = rtt + k * rtt_sd".
    pub timeout_multiplier: Option<f64>,

    /// EWMA smoothing factor of the RTT estimate, in (0, 1].
    pub rtt_alpha: Option<f64>,

    pub min_rto: Option<Duration>,
    pub max_rto: Option<Duration>,

    /// How many times the RTO of a repeatedly lost packet doubles. 0 disables backoff.
    pub max_backoff_doublings: Option<u32>,

    /// The parent span for the spawned session task. If not provided, will use
    /// root span.
    pub parent_span: Option<tracing::Id>,

    /// If provided, this can be used to abruptly terminate the session task.
    pub cancellation_token: CancellationToken,
}

impl SessionOpts {
    pub fn new(inbox: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            inbox: inbox.into(),
            remote: remote.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<ValidatedSessionOpts> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        for (name, inbox) in [("inbox", &self.inbox), ("remote", &self.remote)] {
            if inbox.is_empty() || inbox.len() > MAX_INBOX_LEN {
                return invalid(format!(
                    "{name} must be 1..={MAX_INBOX_LEN} bytes, got {}",
                    inbox.len()
                ));
            }
        }

        let max_window = self.max_window.unwrap_or(DEFAULT_MAX_WINDOW);
        if max_window == 0 || max_window > u32::MAX as usize {
            return invalid(format!("max_window out of range: {max_window}"));
        }

        let timeout_multiplier = self
            .timeout_multiplier
            .unwrap_or(DEFAULT_TIMEOUT_MULTIPLIER);
        if !timeout_multiplier.is_finite() || timeout_multiplier < 0. {
            return invalid(format!(
                "timeout_multiplier must be finite and >= 0, got {timeout_multiplier}"
            ));
        }

        let rtt_alpha = self.rtt_alpha.unwrap_or(DEFAULT_RTT_ALPHA);
        if !(rtt_alpha > 0. && rtt_alpha <= 1.) {
            return invalid(format!("rtt_alpha must be in (0, 1], got {rtt_alpha}"));
        }

        let min_rto = self.min_rto.unwrap_or(DEFAULT_MIN_RTO);
        let max_rto = self.max_rto.unwrap_or(DEFAULT_MAX_RTO);
        if min_rto.is_zero() || min_rto > max_rto {
            return invalid(format!(
                "need 0 < min_rto <= max_rto, got min_rto={min_rto:?} max_rto={max_rto:?}"
            ));
        }

        Ok(ValidatedSessionOpts {
            node_name: self.node_name.clone().unwrap_or_else(|| self.inbox.clone()),
            inbox: self.inbox.clone(),
            remote: self.remote.clone(),
            max_window,
            policy: RetransmitPolicy {
                max_window,
                rtt_alpha,
                timeout_multiplier,
                min_rto,
                max_rto,
                max_backoff_doublings: self
                    .max_backoff_doublings
                    .unwrap_or(DEFAULT_MAX_BACKOFF_DOUBLINGS),
            },
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ValidatedSessionOpts {
    pub node_name: String,
    pub inbox: String,
    pub remote: String,
    pub max_window: usize,
    pub policy: RetransmitPolicy,
}

/// A snapshot of session counters, published by the session task after
/// every event it handles.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Packets that got a sequence number.
    pub submitted: u64,
    pub acked: u64,
    pub in_flight: usize,
    /// Submits waiting for window capacity.
    pub pending: usize,
    pub retransmissions: u64,
    pub duplicate_acks: u64,
    /// In-order payloads handed to the user from the peer.
    pub delivered: u64,
    /// Out-of-order payloads from the peer waiting for a gap to fill.
    pub buffered: usize,
    pub rtt_estimate: Duration,
    pub rtt_sd: Duration,
    pub rtt_samples: u64,
}

impl SessionStats {
    pub fn all_acked(&self) -> bool {
        self.acked == self.submitted && self.pending == 0
    }
}

/// One end of a reliable, ordered packet exchange with a single peer.
///
/// All state lives in a spawned task; this handle talks to it over channels.
/// Dropping the handle shuts the session down.
pub struct Session {
    inbox: String,
    commands: UnboundedSender<Command>,
    incoming: UnboundedReceiver<Payload>,
    events: UnboundedReceiver<NetEvent>,
    stats: watch::Receiver<SessionStats>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub async fn start<N: Network, E: SwpEnvironment>(
        network: N,
        env: E,
        opts: SessionOpts,
    ) -> Result<Self> {
        let parent_span = opts.parent_span.clone();
        let validated = opts.validate()?;
        let inbound = network.listen(&validated.inbox).await?;
        let net_events = network.subscribe_events();

        let span = error_span!(
            parent: parent_span,
            "swp_session",
            node = %validated.node_name,
            inbox = %validated.inbox
        );
        let (session, dispatcher) = Self::new_with_dispatcher(
            network,
            env,
            validated,
            opts.cancellation_token.clone(),
            inbound,
            net_events,
        );
        spawn_with_cancel(
            span,
            session.cancellation_token.clone(),
            dispatcher.run_forever(),
        );
        Ok(session)
    }

    pub(crate) fn new_with_dispatcher<N: Network, E: SwpEnvironment>(
        network: N,
        env: E,
        opts: ValidatedSessionOpts,
        cancellation_token: CancellationToken,
        inbound: UnboundedReceiver<Packet>,
        net_events: Option<UnboundedReceiver<NetEvent>>,
    ) -> (Self, SessionDispatcher<N, E>) {
        let (commands_tx, commands_rx) = unbounded_channel();
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(SessionStats::default());

        let session = Session {
            inbox: opts.inbox.clone(),
            commands: commands_tx,
            incoming: incoming_rx,
            events: events_rx,
            stats: stats_rx,
            cancellation_token,
        };
        let dispatcher = SessionDispatcher::new(
            network,
            env,
            opts,
            commands_rx,
            inbound,
            net_events,
            incoming_tx,
            events_tx,
            stats_tx,
        );
        (session, dispatcher)
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    async fn submit_inner(&self, payload: Payload, wait: bool) -> Result<Seqno> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                payload,
                wait,
                reply: tx,
            })
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Send `payload` reliably. Waits while the send window is full and
    /// resolves with the sequence number once the packet is in flight.
    ///
    /// A [`Error::InitialSendFailed`] still means the packet was scheduled: it
    /// will be retransmitted like any lost packet.
    pub async fn submit(&self, payload: impl Into<Payload>) -> Result<Seqno> {
        self.submit_inner(payload.into(), true).await
    }

    /// Like [`Session::submit`], but fails with [`Error::WindowFull`] instead of waiting.
    pub async fn try_submit(&self, payload: impl Into<Payload>) -> Result<Seqno> {
        self.submit_inner(payload.into(), false).await
    }

    /// Where packet `seq_nr` is in its lifecycle. None if it was never submitted.
    pub async fn state_of(&self, seq_nr: Seqno) -> Result<Option<PacketState>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::StateOf { seq_nr, reply: tx })
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// The next in-order payload from the peer. None once the session is closed.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.incoming.recv().await
    }

    /// The next transport notification.
    pub async fn next_event(&mut self) -> Option<NetEvent> {
        self.events.recv().await
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Wait until the stats satisfy `pred`.
    pub async fn wait_until(
        &self,
        pred: impl FnMut(&SessionStats) -> bool + Send,
    ) -> Result<SessionStats> {
        let mut rx = self.stats.clone();
        let stats = rx.wait_for(pred).await.map_err(|_| Error::SessionClosed)?;
        Ok(stats.clone())
    }

    /// Wait until every submitted packet was acknowledged.
    pub async fn wait_all_acked(&self) -> Result<SessionStats> {
        self.wait_until(SessionStats::all_acked).await
    }

    /// Stop the session. Nothing is retransmitted after this, and pending
    /// submits fail with [`Error::SessionClosed`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Whether the session task is gone.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
