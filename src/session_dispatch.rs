use std::{collections::VecDeque, ops::ControlFlow, pin::Pin, time::Duration};

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    time::{Instant, Sleep},
};
use tracing::{debug, error, trace, warn};

use crate::{
    Payload,
    error::{Error, Result},
    message::Packet,
    metrics::METRICS,
    receiver::{ReceiverWindow, RxOutcome},
    sender::{AckOutcome, PacketState, SenderWindow, TimerTick},
    seq_nr::Seqno,
    session::{SessionStats, ValidatedSessionOpts},
    traits::{NetEvent, Network, SwpEnvironment},
};

pub(crate) enum Command {
    Submit {
        payload: Payload,
        // Queue behind a full window instead of failing.
        wait: bool,
        reply: oneshot::Sender<Result<Seqno>>,
    },
    StateOf {
        seq_nr: Seqno,
        reply: oneshot::Sender<Option<PacketState>>,
    },
    Shutdown,
}

struct PendingSubmit {
    payload: Payload,
    reply: oneshot::Sender<Result<Seqno>>,
}

/// Gives an indication on the next time the session should wake up on its own.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub(crate) enum PollAt {
    /// The earliest retransmission deadline.
    Time(Instant),
    /// Nothing scheduled, only external events matter.
    Ingress,
}

/// The task that owns all of a session's state. Every input (user commands,
/// packets from the network, transport events, the retransmission timer) is
/// handled here one at a time.
pub(crate) struct SessionDispatcher<N, E> {
    network: N,
    env: E,
    opts: ValidatedSessionOpts,

    tx: SenderWindow,
    rx: ReceiverWindow,
    pending: VecDeque<PendingSubmit>,

    commands: UnboundedReceiver<Command>,
    inbound: UnboundedReceiver<Packet>,
    net_events: Option<UnboundedReceiver<NetEvent>>,

    user_tx: UnboundedSender<Payload>,
    user_events: UnboundedSender<NetEvent>,
    stats: watch::Sender<SessionStats>,

    sleep: Pin<Box<Sleep>>,
    poll_at: PollAt,
}

async fn recv_event(rx: &mut Option<UnboundedReceiver<NetEvent>>) -> Option<NetEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_packet<N: Network>(network: &N, packet: &Packet, reason: &'static str) -> Result<()> {
    trace!(header = %packet.header.short_repr(), dest = %packet.dest, reason, "sending");
    network.send(packet, reason).await.inspect_err(|e| {
        METRICS.send_errors.increment(1);
        warn!(header = %packet.header.short_repr(), reason, "error sending: {e:#}");
    })
}

impl<N: Network, E: SwpEnvironment> SessionDispatcher<N, E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        network: N,
        env: E,
        opts: ValidatedSessionOpts,
        commands: UnboundedReceiver<Command>,
        inbound: UnboundedReceiver<Packet>,
        net_events: Option<UnboundedReceiver<NetEvent>>,
        user_tx: UnboundedSender<Payload>,
        user_events: UnboundedSender<NetEvent>,
        stats: watch::Sender<SessionStats>,
    ) -> Self {
        METRICS.live_sessions.increment(1.);
        Self {
            tx: SenderWindow::new(&opts.inbox, &opts.remote, opts.policy),
            rx: ReceiverWindow::new(opts.max_window),
            pending: Default::default(),
            network,
            env,
            opts,
            commands,
            inbound,
            net_events,
            user_tx,
            user_events,
            stats,
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            poll_at: PollAt::Ingress,
        }
    }

    pub(crate) async fn run_forever(mut self) -> Result<()> {
        debug!(remote = %self.opts.remote, "session started");
        loop {
            match self.run_once().await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return Ok(()),
                Err(e) => {
                    if e.is_bug() {
                        error!("error running session: {e:#}");
                    } else {
                        warn!("error running session: {e:#}");
                    }
                    self.shutdown();
                    return Err(e);
                }
            }
        }
    }

    async fn run_once(&mut self) -> Result<ControlFlow<()>> {
        self.on_timer().await?;
        self.publish_stats();

        tokio::select! {
            cmd = self.commands.recv() => match cmd {
                Some(cmd) => return self.on_command(cmd).await,
                None => {
                    trace!("session handle dropped");
                    self.shutdown();
                    return Ok(ControlFlow::Break(()));
                }
            },
            packet = self.inbound.recv() => match packet {
                Some(packet) => self.on_packet(packet).await?,
                None => return Err(Error::SubscriptionClosed),
            },
            event = recv_event(&mut self.net_events) => match event {
                Some(event) => self.on_net_event(event)?,
                None => {
                    trace!("transport event stream ended");
                    self.net_events = None;
                }
            },
            _ = &mut self.sleep, if matches!(self.poll_at, PollAt::Time(_)) => {
                trace!("retransmission timer fired");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    pub(crate) async fn on_command(&mut self, cmd: Command) -> Result<ControlFlow<()>> {
        match cmd {
            Command::Submit {
                payload,
                wait,
                reply,
            } => {
                if self.pending.is_empty() && self.tx.has_capacity() {
                    let res = self.admit(payload).await;
                    let _ = reply.send(res);
                } else if wait {
                    trace!(
                        in_flight = self.tx.in_flight(),
                        pending = self.pending.len(),
                        "window full, queueing submit"
                    );
                    self.pending.push_back(PendingSubmit { payload, reply });
                } else {
                    METRICS.window_full.increment(1);
                    let _ = reply.send(Err(Error::WindowFull {
                        in_flight: self.tx.in_flight(),
                    }));
                }
                Ok(ControlFlow::Continue(()))
            }
            Command::StateOf { seq_nr, reply } => {
                let _ = reply.send(self.tx.state_of(seq_nr));
                Ok(ControlFlow::Continue(()))
            }
            Command::Shutdown => {
                self.shutdown();
                Ok(ControlFlow::Break(()))
            }
        }
    }

    // Number and send a packet. It's scheduled even if the first send fails.
    async fn admit(&mut self, payload: Payload) -> Result<Seqno> {
        let packet = self.tx.submit(payload, self.env.now())?;
        let seq_nr = packet.seq_nr();
        match send_packet(&self.network, &packet, "data").await {
            Ok(()) => Ok(seq_nr),
            Err(e) => Err(Error::InitialSendFailed {
                seq_nr,
                source: match e {
                    Error::Send(e) => e,
                    other => std::io::Error::other(other),
                },
            }),
        }
    }

    async fn admit_pending(&mut self) {
        while self.tx.has_capacity() {
            let Some(p) = self.pending.pop_front() else {
                return;
            };
            if p.reply.is_closed() {
                trace!("submitter went away, skipping");
                continue;
            }
            let res = self.admit(p.payload).await;
            let _ = p.reply.send(res);
        }
    }

    pub(crate) async fn on_packet(&mut self, packet: Packet) -> Result<()> {
        let Packet {
            header,
            from,
            dest,
            data,
        } = packet;
        trace!(header = %header.short_repr(), %from, "received");
        if dest != self.opts.inbox {
            debug!(%dest, "packet for another inbox, dropping");
            return Ok(());
        }

        if header.is_ack() {
            if let AckOutcome::Acked {
                rtt_sample: Some(rtt),
            } = self.tx.on_ack_packet(&header, self.env.now())?
            {
                trace!(seq_nr = ?header.ack_nr, ?rtt, "rtt sample");
            }
            self.admit_pending().await;
        }

        if header.is_data() {
            let outcome = self.rx.on_data(header.seq_nr, data);
            let should_ack = outcome.should_ack();
            if let RxOutcome::Deliver(payloads) = outcome {
                for payload in payloads {
                    if self.user_tx.send(payload).is_err() {
                        trace!("user receiver dropped, discarding payload");
                    }
                }
            }
            if should_ack {
                let ack = Packet {
                    header: self.rx.ack_header(header.seq_nr),
                    from: self.opts.inbox.clone(),
                    dest: from,
                    data: Vec::new(),
                };
                // A lost ACK is recovered by the peer retransmitting.
                let _ = send_packet(&self.network, &ack, "ack").await;
            }
        }
        Ok(())
    }

    pub(crate) fn on_net_event(&mut self, event: NetEvent) -> Result<()> {
        METRICS.transport_events.increment(1);
        let fatal = match &event {
            NetEvent::AsyncError { error, fatal } => {
                if *fatal {
                    error!(%error, "fatal transport error");
                } else {
                    warn!(%error, "transport error");
                }
                fatal.then(|| error.clone())
            }
            NetEvent::Disconnected => {
                warn!("transport disconnected");
                None
            }
            other => {
                debug!(event = ?other, "transport event");
                None
            }
        };
        let _ = self.user_events.send(event);
        match fatal {
            Some(error) => Err(Error::FatalTransport(error)),
            None => Ok(()),
        }
    }

    /// Retransmit whatever is due and arm the timer for the next deadline.
    pub(crate) async fn on_timer(&mut self) -> Result<()> {
        loop {
            match self.tx.on_timer_tick(self.env.now())? {
                TimerTick::Idle => {
                    self.poll_at = PollAt::Ingress;
                    return Ok(());
                }
                TimerTick::NotDue(at) => {
                    if self.poll_at != PollAt::Time(at) {
                        trace!(deadline = ?at - self.env.now(), "arming timer");
                        self.sleep.as_mut().reset(at);
                        self.poll_at = PollAt::Time(at);
                    }
                    return Ok(());
                }
                TimerTick::Retransmit(packet) => {
                    // Failure is handled like a loss: it'll be retried later.
                    let _ = send_packet(&self.network, &packet, "retransmit").await;
                }
            }
        }
    }

    fn snapshot(&self) -> SessionStats {
        let counters = self.tx.counters;
        let rtte = self.tx.rtte();
        SessionStats {
            submitted: counters.submitted,
            acked: counters.acked,
            in_flight: self.tx.in_flight(),
            pending: self.pending.len(),
            retransmissions: counters.retransmissions,
            duplicate_acks: counters.duplicate_acks,
            delivered: self.rx.delivered,
            buffered: self.rx.buffered(),
            rtt_estimate: rtte.estimate(),
            rtt_sd: rtte.sd(),
            rtt_samples: rtte.samples(),
        }
    }

    fn publish_stats(&self) {
        let stats = self.snapshot();
        self.stats.send_if_modified(|current| {
            if *current == stats {
                return false;
            }
            *current = stats;
            true
        });
    }

    // Stop retransmitting and fail queued submits.
    fn shutdown(&mut self) {
        let outstanding = self.tx.drain();
        let pending = self.pending.len();
        // Dropping the reply senders wakes the submitters with SessionClosed.
        self.pending.clear();
        self.publish_stats();
        debug!(outstanding, pending, "session shut down");
    }
}

impl<N, E> Drop for SessionDispatcher<N, E> {
    fn drop(&mut self) {
        METRICS.live_sessions.decrement(1.);
    }
}

#[cfg(test)]
mod tests {
    use std::{ops::ControlFlow, time::Duration};

    use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
    use tokio_util::sync::CancellationToken;

    use super::{Command, PollAt, SessionDispatcher};
    use crate::{
        Session, SessionOpts,
        error::{Error, Result},
        message::Packet,
        sender::PacketState,
        seq_nr::Seqno,
        sim_net::SimNet,
        test_util::{env::MockSwpEnvironment, setup_test_logging},
        traits::{NetEvent, Network},
    };

    const MS: Duration = Duration::from_millis(1);

    struct TestSession {
        net: SimNet,
        env: MockSwpEnvironment,
        session: Session,
        dispatcher: SessionDispatcher<SimNet, MockSwpEnvironment>,
        // What the session sends to its peer.
        peer: UnboundedReceiver<Packet>,
    }

    impl TestSession {
        async fn new(max_window: usize) -> Self {
            setup_test_logging();
            let net = SimNet::new();
            let env = MockSwpEnvironment::new();
            let opts = SessionOpts {
                max_window: Some(max_window),
                ..SessionOpts::new("a", "b")
            }
            .validate()
            .unwrap();
            let inbound = net.listen("a").await.unwrap();
            let peer = net.listen("b").await.unwrap();
            let (session, dispatcher) = Session::new_with_dispatcher(
                net.clone(),
                env.clone(),
                opts,
                CancellationToken::new(),
                inbound,
                net.subscribe_events(),
            );
            Self {
                net,
                env,
                session,
                dispatcher,
                peer,
            }
        }

        async fn submit(&mut self, payload: &[u8], wait: bool) -> oneshot::Receiver<Result<Seqno>> {
            let (tx, rx) = oneshot::channel();
            let flow = self
                .dispatcher
                .on_command(Command::Submit {
                    payload: payload.to_vec(),
                    wait,
                    reply: tx,
                })
                .await
                .unwrap();
            assert_eq!(flow, ControlFlow::Continue(()));
            rx
        }

        async fn state_of(&mut self, seq_nr: u64) -> Option<PacketState> {
            let (tx, mut rx) = oneshot::channel();
            self.dispatcher
                .on_command(Command::StateOf {
                    seq_nr: Seqno(seq_nr),
                    reply: tx,
                })
                .await
                .unwrap();
            rx.try_recv().unwrap()
        }

        fn take_sent(&mut self) -> Vec<Packet> {
            let mut sent = Vec::new();
            while let Ok(p) = self.peer.try_recv() {
                sent.push(p);
            }
            sent
        }

        // The peer's first ACK, opening the window up to our own limit.
        async fn handshake(&mut self) {
            self.submit(b"hello", true).await;
            self.ack(0, 1).await;
            self.take_sent();
        }

        async fn ack(&mut self, seq_nr: u64, cumulative: u64) {
            let ack = Packet::new_ack(Seqno(seq_nr), Seqno(cumulative), 64, "b", "a");
            self.dispatcher.on_packet(ack).await.unwrap();
        }
    }

    fn seq_nrs(packets: &[Packet]) -> Vec<u64> {
        packets.iter().map(|p| p.seq_nr().0).collect()
    }

    #[tokio::test]
    async fn test_submit_sends_and_ack_releases() {
        let mut t = TestSession::new(4).await;
        let mut reply = t.submit(b"hello", true).await;
        assert_eq!(reply.try_recv().unwrap().unwrap(), Seqno(0));

        let sent = t.take_sent();
        assert_eq!(seq_nrs(&sent), vec![0]);
        assert_eq!(sent[0].payload(), b"hello");
        assert_eq!(t.state_of(0).await, Some(PacketState::InFlight));
        assert_eq!(t.state_of(1).await, None);

        t.env.increment_now(5 * MS);
        t.ack(0, 1).await;
        assert_eq!(t.state_of(0).await, Some(PacketState::Acknowledged));
        t.dispatcher.publish_stats();
        let stats = t.session.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.rtt_estimate, 5 * MS);
        assert!(stats.all_acked());
    }

    #[tokio::test]
    async fn test_try_submit_window_full() {
        let mut t = TestSession::new(2).await;
        t.handshake().await;
        t.submit(b"1", false).await;
        t.submit(b"2", false).await;
        let mut reply = t.submit(b"3", false).await;
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(Error::WindowFull { in_flight: 2 })
        ));
        assert_eq!(seq_nrs(&t.take_sent()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_blocking_submit_waits_for_capacity() {
        let mut t = TestSession::new(2).await;
        t.handshake().await;
        t.submit(b"1", true).await;
        t.submit(b"2", true).await;
        let mut blocked = t.submit(b"3", true).await;
        assert!(matches!(
            blocked.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(seq_nrs(&t.take_sent()), vec![1, 2]);

        t.ack(2, 1).await;
        assert_eq!(blocked.try_recv().unwrap().unwrap(), Seqno(3));
        assert_eq!(seq_nrs(&t.take_sent()), vec![3]);
    }

    #[tokio::test]
    async fn test_peer_window_bounds_admission() {
        let mut t = TestSession::new(8).await;
        t.submit(b"0", true).await;
        // Nothing heard from the peer yet: one packet at a time.
        let mut blocked = t.submit(b"1", true).await;
        assert!(matches!(
            blocked.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(seq_nrs(&t.take_sent()), vec![0]);

        // The peer only buffers 2.
        let ack = Packet::new_ack(Seqno(0), Seqno(1), 2, "b", "a");
        t.dispatcher.on_packet(ack).await.unwrap();
        assert_eq!(blocked.try_recv().unwrap().unwrap(), Seqno(1));
        t.submit(b"2", true).await;
        let mut blocked = t.submit(b"3", true).await;
        assert!(matches!(
            blocked.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(seq_nrs(&t.take_sent()), vec![1, 2]);

        let ack = Packet::new_ack(Seqno(1), Seqno(2), 2, "b", "a");
        t.dispatcher.on_packet(ack).await.unwrap();
        assert_eq!(blocked.try_recv().unwrap().unwrap(), Seqno(3));
        assert_eq!(seq_nrs(&t.take_sent()), vec![3]);
    }

    #[tokio::test]
    async fn test_retransmit_timer() {
        let mut t = TestSession::new(4).await;
        t.submit(b"x", true).await;
        t.take_sent();

        t.dispatcher.on_timer().await.unwrap();
        let first_deadline = match t.dispatcher.poll_at {
            PollAt::Time(at) => at,
            PollAt::Ingress => panic!("timer not armed"),
        };
        assert!(t.take_sent().is_empty());

        t.env.increment_now(40 * MS);
        t.dispatcher.on_timer().await.unwrap();
        let resent = t.take_sent();
        assert_eq!(seq_nrs(&resent), vec![0]);
        assert_eq!(resent[0].payload(), b"x");
        match t.dispatcher.poll_at {
            PollAt::Time(at) => assert!(at > first_deadline),
            PollAt::Ingress => panic!("timer not rearmed"),
        }

        t.ack(0, 1).await;
        t.dispatcher.on_timer().await.unwrap();
        assert_eq!(t.dispatcher.poll_at, PollAt::Ingress);
    }

    #[tokio::test]
    async fn test_receive_reorders_and_acks() {
        let mut t = TestSession::new(4).await;
        for seq in [1, 0, 1] {
            let p = Packet::new_data(Seqno(seq), "b", "a", vec![seq as u8]);
            t.dispatcher.on_packet(p).await.unwrap();
        }

        let acks = t.take_sent();
        assert!(acks.iter().all(|a| a.header.is_ack()));
        let acked: Vec<_> = acks
            .iter()
            .map(|a| (a.header.ack_nr.0, a.header.cumulative_ack.0))
            .collect();
        assert_eq!(acked, vec![(1, 0), (0, 2), (1, 2)]);

        assert_eq!(t.session.recv().await, Some(vec![0]));
        assert_eq!(t.session.recv().await, Some(vec![1]));
        t.dispatcher.publish_stats();
        assert_eq!(t.session.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_out_of_window_is_not_acked() {
        let mut t = TestSession::new(4).await;
        let p = Packet::new_data(Seqno(4), "b", "a", vec![]);
        t.dispatcher.on_packet(p).await.unwrap();
        assert!(t.take_sent().is_empty());
    }

    #[tokio::test]
    async fn test_initial_send_failure_keeps_packet_scheduled() {
        let mut t = TestSession::new(4).await;
        t.net.fail_next(|p| p.header.is_data());
        let mut reply = t.submit(b"x", true).await;
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(Error::InitialSendFailed {
                seq_nr: Seqno(0),
                ..
            })
        ));
        assert!(t.take_sent().is_empty());

        t.env.increment_now(40 * MS);
        t.dispatcher.on_timer().await.unwrap();
        assert_eq!(seq_nrs(&t.take_sent()), vec![0]);
    }

    #[tokio::test]
    async fn test_fatal_event_terminates() {
        let mut t = TestSession::new(4).await;
        t.dispatcher.on_net_event(NetEvent::Reconnected).unwrap();
        let err = t
            .dispatcher
            .on_net_event(NetEvent::AsyncError {
                error: "permissions violation".into(),
                fatal: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::FatalTransport(_)));
        assert_eq!(t.session.next_event().await, Some(NetEvent::Reconnected));
        assert!(matches!(
            t.session.next_event().await,
            Some(NetEvent::AsyncError { fatal: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_stops_timer() {
        let mut t = TestSession::new(1).await;
        t.submit(b"0", true).await;
        let mut blocked = t.submit(b"1", true).await;

        let flow = t.dispatcher.on_command(Command::Shutdown).await.unwrap();
        assert_eq!(flow, ControlFlow::Break(()));
        assert!(matches!(
            blocked.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        t.take_sent();
        t.env.increment_now(Duration::from_secs(100));
        t.dispatcher.on_timer().await.unwrap();
        assert!(t.take_sent().is_empty());
        assert_eq!(t.dispatcher.poll_at, PollAt::Ingress);
    }
}
