use std::{collections::BTreeMap, time::Duration};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    Payload,
    error::{Error, OptionContext, Result},
    message::Packet,
    metrics::METRICS,
    raw::PacketHeader,
    retry_queue::{Deadline, RetryQueue},
    rtt::RttEstimator,
    seq_nr::Seqno,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetransmitPolicy {
    pub max_window: usize,
    pub rtt_alpha: f64,
    pub timeout_multiplier: f64,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub max_backoff_doublings: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Sent, waiting for an ACK. Scheduled for retransmission.
    InFlight,
    /// ACKed, the slot is gone.
    Acknowledged,
}

/// One outstanding packet.
#[derive(Debug)]
pub(crate) struct TxqSlot {
    pub packet: Packet,
    // Mirrors the slot's entry in the retry queue. None once cancelled.
    pub retry_deadline: Deadline,
    pub retries: u32,
    pub last_sent_at: Instant,
}

#[derive(Debug)]
pub(crate) enum AckOutcome {
    Acked { rtt_sample: Option<Duration> },
    // Slot already gone: a duplicate, or covered by an earlier cumulative ACK.
    Duplicate,
}

#[derive(Debug)]
pub(crate) enum TimerTick {
    /// Nothing live left in the queue, wait for new packets.
    Idle,
    /// The earliest packet is due. It was already rescheduled.
    Retransmit(Packet),
    /// The earliest deadline is in the future.
    NotDue(Instant),
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SenderCounters {
    pub submitted: u64,
    pub acked: u64,
    pub retransmissions: u64,
    pub duplicate_acks: u64,
}

/// Sending half of a session: sequence numbering, outstanding slots, RTO
/// scheduling.
pub(crate) struct SenderWindow {
    inbox: String,
    remote: String,
    policy: RetransmitPolicy,

    next_seq_nr: Seqno,
    // One past the highest seq the peer said it accepts. None until the first ACK.
    peer_limit: Option<Seqno>,
    slots: BTreeMap<Seqno, TxqSlot>,
    queue: RetryQueue,
    rtte: RttEstimator,

    pub counters: SenderCounters,
}

impl SenderWindow {
    pub fn new(inbox: &str, remote: &str, policy: RetransmitPolicy) -> Self {
        Self {
            inbox: inbox.to_owned(),
            remote: remote.to_owned(),
            policy,
            next_seq_nr: Seqno(0),
            peer_limit: None,
            slots: Default::default(),
            queue: Default::default(),
            rtte: RttEstimator::new(policy.rtt_alpha),
            counters: Default::default(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.policy.max_window && self.next_seq_nr < self.peer_limit()
    }

    // Until the peer advertised its window, keep a single packet outstanding.
    fn peer_limit(&self) -> Seqno {
        self.peer_limit.unwrap_or(self.low_water() + 1)
    }

    /// Record the receive window the peer advertised in an ACK. Only ever
    /// grows, ACKs may arrive out of order.
    pub fn on_window_update(&mut self, cumulative: Seqno, wnd: u32) {
        let limit = cumulative + u64::from(wnd.max(1));
        if self.peer_limit.is_none_or(|cur| cur < limit) {
            trace!(?limit, "peer window moved");
            self.peer_limit = Some(limit);
        }
    }

    pub fn rtte(&self) -> &RttEstimator {
        &self.rtte
    }

    /// Lowest sequence number that isn't acknowledged yet.
    pub fn low_water(&self) -> Seqno {
        self.slots
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_seq_nr)
    }

    pub fn state_of(&self, seq_nr: Seqno) -> Option<PacketState> {
        if self.slots.contains_key(&seq_nr) {
            Some(PacketState::InFlight)
        } else if seq_nr < self.next_seq_nr {
            Some(PacketState::Acknowledged)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().and_then(|(_, d)| d)
    }

    fn rto(&self, retries: u32) -> Duration {
        let p = &self.policy;
        let base = self
            .rtte
            .retransmission_timeout(p.timeout_multiplier, p.min_rto, p.max_rto);
        let backoff = 2u32.saturating_pow(retries.min(p.max_backoff_doublings));
        base.saturating_mul(backoff).min(p.max_rto)
    }

    fn deadline(&self, from: Instant, retries: u32) -> Result<Instant> {
        from.checked_add(self.rto(retries))
            .ok_or(Error::BugDeadlineOverflow)
    }

    /// Assign the next sequence number and schedule the packet. The caller
    /// sends the returned packet.
    pub fn submit(&mut self, payload: Payload, now: Instant) -> Result<Packet> {
        if !self.has_capacity() {
            METRICS.window_full.increment(1);
            return Err(Error::WindowFull {
                in_flight: self.in_flight(),
            });
        }
        let seq_nr = self.next_seq_nr;
        let deadline = self.deadline(now, 0)?;
        let packet = Packet::new_data(seq_nr, &self.inbox, &self.remote, payload);

        self.queue.insert(seq_nr, Some(deadline))?;
        self.slots.insert(
            seq_nr,
            TxqSlot {
                packet: packet.clone(),
                retry_deadline: Some(deadline),
                retries: 0,
                last_sent_at: now,
            },
        );
        self.next_seq_nr += 1;
        self.counters.submitted += 1;
        METRICS.submitted.increment(1);
        trace!(?seq_nr, rto=?deadline - now, in_flight=self.in_flight(), "submitted");
        Ok(packet)
    }

    /// Apply an incoming ACK packet: the selectively acked slot plus everything
    /// below the cumulative mark.
    pub fn on_ack_packet(&mut self, header: &PacketHeader, now: Instant) -> Result<AckOutcome> {
        let outcome = self.on_ack_received(header.ack_nr, now)?;
        self.on_cumulative_ack(header.cumulative_ack)?;
        self.on_window_update(header.cumulative_ack, header.wnd);
        Ok(outcome)
    }

    pub fn on_ack_received(&mut self, seq_nr: Seqno, now: Instant) -> Result<AckOutcome> {
        METRICS.acks_received.increment(1);
        let slot = match self.slots.remove(&seq_nr) {
            Some(slot) => slot,
            None => {
                trace!(?seq_nr, "duplicate or stale ack, ignoring");
                self.counters.duplicate_acks += 1;
                METRICS.duplicate_acks.increment(1);
                return Ok(AckOutcome::Duplicate);
            }
        };
        self.queue.cancel(seq_nr)?;
        self.counters.acked += 1;

        // Karn: the ACK of a retransmitted packet can't tell which copy it's for.
        let rtt_sample = if slot.retries == 0 {
            let sample = now.saturating_duration_since(slot.last_sent_at);
            self.rtte.add_sample(sample);
            METRICS.rtt.record(sample.as_secs_f64());
            self.reschedule_unretried()?;
            Some(sample)
        } else {
            None
        };
        trace!(?seq_nr, ?rtt_sample, retries = slot.retries, "acked");

        self.maybe_purge_cancelled();
        Ok(AckOutcome::Acked { rtt_sample })
    }

    /// Release every slot below `cumulative`. No RTT samples are taken from them.
    pub fn on_cumulative_ack(&mut self, cumulative: Seqno) -> Result<usize> {
        if self.low_water() >= cumulative {
            return Ok(0);
        }
        let rest = self.slots.split_off(&cumulative);
        let released = std::mem::replace(&mut self.slots, rest);
        for seq_nr in released.keys() {
            self.queue.cancel(*seq_nr)?;
        }
        self.counters.acked += released.len() as u64;
        trace!(?cumulative, released = released.len(), "cumulative ack");
        self.maybe_purge_cancelled();
        Ok(released.len())
    }

    // The estimate moved, so packets that were never retransmitted get a
    // deadline from the new estimate. Backed off ones keep theirs.
    fn reschedule_unretried(&mut self) -> Result<()> {
        let rto = self.rto(0);
        for (seq_nr, slot) in self.slots.iter_mut() {
            if slot.retries != 0 {
                continue;
            }
            let deadline = slot
                .last_sent_at
                .checked_add(rto)
                .ok_or(Error::BugDeadlineOverflow)?;
            if slot.retry_deadline != Some(deadline) {
                slot.retry_deadline = Some(deadline);
                self.queue.update(*seq_nr, Some(deadline))?;
            }
        }
        Ok(())
    }

    // Cancelled entries are normally reaped when they reach the front, which
    // only happens once nothing live is left. Under steady traffic that may never
    // happen, so bound them.
    fn maybe_purge_cancelled(&mut self) {
        let cancelled = self.queue.len() - self.queue.live_len();
        if cancelled > self.policy.max_window {
            let purged = self.queue.purge_cancelled();
            trace!(purged, "purged cancelled retry entries");
        }
    }

    /// Pop the earliest entry and act on it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn on_timer_tick(&mut self, now: Instant) -> Result<TimerTick> {
        let (seq_nr, deadline) = match self.queue.pop() {
            Some(e) => e,
            None => return Ok(TimerTick::Idle),
        };
        let deadline = match deadline {
            Some(d) => d,
            None => {
                // Everything left is cancelled.
                self.queue.clear();
                return Ok(TimerTick::Idle);
            }
        };
        if now < deadline {
            self.queue.insert(seq_nr, Some(deadline))?;
            return Ok(TimerTick::NotDue(deadline));
        }

        let retries = self
            .slots
            .get(&seq_nr)
            .map(|slot| slot.retries + 1)
            .context("bug: live retry entry without a slot")?;
        let new_deadline = self.deadline(now, retries)?;
        self.queue.insert(seq_nr, Some(new_deadline))?;

        let slot = self
            .slots
            .get_mut(&seq_nr)
            .context("bug: live retry entry without a slot")?;
        slot.retries = retries;
        slot.retry_deadline = Some(new_deadline);
        slot.last_sent_at = now;
        self.counters.retransmissions += 1;
        METRICS.retransmissions.increment(1);
        debug!(?seq_nr, retries, next_rto=?new_deadline - now, "retransmitting");
        Ok(TimerTick::Retransmit(slot.packet.clone()))
    }

    /// Forget everything. Used on shutdown: nothing fires after this.
    pub fn drain(&mut self) -> usize {
        let outstanding = self.slots.len();
        self.slots.clear();
        self.queue.clear();
        outstanding
    }
}
