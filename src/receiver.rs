use std::collections::BTreeMap;

use tracing::trace;

use crate::{Payload, metrics::METRICS, raw::PacketHeader, seq_nr::Seqno};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RxOutcome {
    /// In-order payloads, ready for the user. Includes anything buffered
    /// behind the packet that just arrived.
    Deliver(Vec<Payload>),
    /// Arrived ahead of a gap; held until the gap fills.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead of the window. Dropped and not acknowledged.
    OutOfWindow,
}

impl RxOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, RxOutcome::OutOfWindow)
    }
}

/// Receiving half of a session: puts packets back in order.
pub(crate) struct ReceiverWindow {
    // Everything below this was delivered.
    next_expected: Seqno,
    window: usize,
    out_of_order: BTreeMap<Seqno, Payload>,
    pub delivered: u64,
}

impl ReceiverWindow {
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: Seqno(0),
            window,
            out_of_order: Default::default(),
            delivered: 0,
        }
    }

    #[cfg(test)]
    pub fn next_expected(&self) -> Seqno {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }

    /// Advertised to the sender: seqs in `[next_expected, next_expected + window)`
    /// are accepted.
    pub fn advertised_window(&self) -> u32 {
        self.window.min(u32::MAX as usize) as u32
    }

    pub fn on_data(&mut self, seq_nr: Seqno, payload: Payload) -> RxOutcome {
        if seq_nr < self.next_expected {
            trace!(?seq_nr, next_expected=?self.next_expected, "already delivered");
            METRICS.duplicate_packets.increment(1);
            return RxOutcome::Duplicate;
        }
        if seq_nr - self.next_expected >= self.window as u64 {
            trace!(?seq_nr, next_expected=?self.next_expected, "out of window, dropping");
            METRICS.out_of_window_packets.increment(1);
            return RxOutcome::OutOfWindow;
        }
        if seq_nr > self.next_expected {
            if self.out_of_order.contains_key(&seq_nr) {
                METRICS.duplicate_packets.increment(1);
                return RxOutcome::Duplicate;
            }
            trace!(?seq_nr, next_expected=?self.next_expected, "out of order, buffering");
            METRICS.out_of_order_packets.increment(1);
            self.out_of_order.insert(seq_nr, payload);
            return RxOutcome::Buffered;
        }

        let mut ready = vec![payload];
        self.next_expected += 1;
        while let Some(payload) = self.out_of_order.remove(&self.next_expected) {
            ready.push(payload);
            self.next_expected += 1;
        }
        self.delivered += ready.len() as u64;
        METRICS.delivered.increment(ready.len() as u64);
        RxOutcome::Deliver(ready)
    }

    pub fn ack_header(&self, seq_nr: Seqno) -> PacketHeader {
        PacketHeader::ack(seq_nr, self.next_expected, self.advertised_window())
    }
}
