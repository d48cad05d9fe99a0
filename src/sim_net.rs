//! An in-process [`Network`] for tests and simulations. Packets go through
//! the wire encoding and can be dropped, duplicated or delayed on the way.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

use crate::{
    error::{Error, Result},
    message::Packet,
    raw::PacketHeader,
    seq_nr::Seqno,
    traits::{NetEvent, Network},
};

#[derive(Debug, Default, Clone, Copy)]
pub struct SimNetOpts {
    /// Chance of losing each packet, in percent.
    pub loss_pct: f64,
    /// Chance of delivering a packet twice, in percent.
    pub dup_pct: f64,
    /// One-way latency. Packets are delivered immediately if not set.
    pub delay: Option<Duration>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimNetStats {
    pub sent: usize,
    pub lost: usize,
    pub duplicated: usize,
    /// Addressed to an inbox nobody listens on.
    pub undeliverable: usize,
}

/// A packet as it went through [`SimNet::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub header: PacketHeader,
    pub from: String,
    pub dest: String,
    pub reason: &'static str,
    pub lost: bool,
}

type PacketRule = Box<dyn FnMut(&Packet) -> bool + Send>;

#[derive(Default)]
struct SimNetLocked {
    inboxes: HashMap<String, UnboundedSender<Packet>>,
    drop_rules: Vec<PacketRule>,
    fail_rules: Vec<PacketRule>,
    event_subscribers: Vec<UnboundedSender<NetEvent>>,
    log: Vec<SentRecord>,
    stats: SimNetStats,
}

struct SimNetInner {
    opts: SimNetOpts,
    locked: Mutex<SimNetLocked>,
}

#[derive(Clone)]
pub struct SimNet {
    inner: Arc<SimNetInner>,
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

// Run the first rule that matches and remove it.
fn take_matching_rule(rules: &mut Vec<PacketRule>, packet: &Packet) -> bool {
    match rules.iter_mut().position(|rule| rule(packet)) {
        Some(idx) => {
            drop(rules.remove(idx));
            true
        }
        None => false,
    }
}

impl SimNet {
    pub fn new() -> Self {
        Self::with_opts(Default::default())
    }

    pub fn with_opts(opts: SimNetOpts) -> Self {
        Self {
            inner: Arc::new(SimNetInner {
                opts,
                locked: Default::default(),
            }),
        }
    }

    /// Lose the next packet matching `pred`.
    pub fn drop_next(&self, pred: impl FnMut(&Packet) -> bool + Send + 'static) {
        self.inner.locked.lock().drop_rules.push(Box::new(pred));
    }

    /// Fail the next send of a packet matching `pred` with an I/O error.
    pub fn fail_next(&self, pred: impl FnMut(&Packet) -> bool + Send + 'static) {
        self.inner.locked.lock().fail_rules.push(Box::new(pred));
    }

    /// Broadcast a transport event to everyone subscribed.
    pub fn inject_event(&self, event: NetEvent) {
        self.inner
            .locked
            .lock()
            .event_subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Stop delivering to `inbox`. Its packet stream ends. Returns false if
    /// nobody was listening.
    pub fn close_inbox(&self, inbox: &str) -> bool {
        self.inner.locked.lock().inboxes.remove(inbox).is_some()
    }

    pub fn stats(&self) -> SimNetStats {
        self.inner.locked.lock().stats
    }

    pub fn sent_log(&self) -> Vec<SentRecord> {
        self.inner.locked.lock().log.clone()
    }

    /// How many times DATA packet `seq_nr` was sent to `dest`, lost or not.
    pub fn data_sends(&self, dest: &str, seq_nr: Seqno) -> usize {
        self.inner
            .locked
            .lock()
            .log
            .iter()
            .filter(|r| r.header.is_data() && r.header.seq_nr == seq_nr && r.dest == dest)
            .count()
    }

    fn deliver(&self, tx: UnboundedSender<Packet>, packet: Packet) {
        match self.inner.opts.delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(packet);
                });
            }
            None => {
                let _ = tx.send(packet);
            }
        }
    }
}

impl Network for SimNet {
    async fn send<'a>(&'a self, packet: &'a Packet, reason: &'static str) -> Result<()> {
        let bytes = packet.serialize()?;
        let (tx, copies) = {
            let mut g = self.inner.locked.lock();
            let g = &mut *g;

            if take_matching_rule(&mut g.fail_rules, packet) {
                trace!(header = %packet.header.short_repr(), "injected send failure");
                return Err(Error::Send(std::io::Error::other("injected send failure")));
            }

            let mut rng = rand::rng();
            let lost = take_matching_rule(&mut g.drop_rules, packet)
                || (self.inner.opts.loss_pct > 0.
                    && rng.random_bool((self.inner.opts.loss_pct / 100.).min(1.)));
            let duplicated = !lost
                && self.inner.opts.dup_pct > 0.
                && rng.random_bool((self.inner.opts.dup_pct / 100.).min(1.));

            g.stats.sent += 1;
            g.log.push(SentRecord {
                header: packet.header,
                from: packet.from.clone(),
                dest: packet.dest.clone(),
                reason,
                lost,
            });
            if lost {
                trace!(header = %packet.header.short_repr(), reason, "simulating loss");
                g.stats.lost += 1;
                return Ok(());
            }
            if duplicated {
                g.stats.duplicated += 1;
            }

            match g.inboxes.get(&packet.dest) {
                Some(tx) => (tx.clone(), if duplicated { 2 } else { 1 }),
                None => {
                    trace!(dest = %packet.dest, "nobody listens, dropping");
                    g.stats.undeliverable += 1;
                    return Ok(());
                }
            }
        };

        for _ in 0..copies {
            match Packet::deserialize(&bytes) {
                Some(p) => self.deliver(tx.clone(), p),
                None => trace!(len = bytes.len(), "error deserializing packet"),
            }
        }
        Ok(())
    }

    async fn listen<'a>(&'a self, inbox: &'a str) -> Result<UnboundedReceiver<Packet>> {
        let mut g = self.inner.locked.lock();
        if g.inboxes.get(inbox).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::AlreadyListening(inbox.to_owned()));
        }
        let (tx, rx) = unbounded_channel();
        g.inboxes.insert(inbox.to_owned(), tx);
        Ok(rx)
    }

    fn subscribe_events(&self) -> Option<UnboundedReceiver<NetEvent>> {
        let (tx, rx) = unbounded_channel();
        self.inner.locked.lock().event_subscribers.push(tx);
        Some(rx)
    }
}
