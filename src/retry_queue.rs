//! Timeout-ordered queue of in-flight packets.
//!
//! A binary heap over a `Vec`, plus a map from sequence number to the entry's
//! position in the heap, so that any entry can be re-prioritized in O(log n).
//! Entries are ordered by retry deadline, earliest first. A cancelled entry
//! (deadline `None`) sorts after every live one, so it's only ever popped once
//! nothing live is left.

use rustc_hash::FxHashMap as HashMap;
use tokio::time::Instant;
use tracing::error;

use crate::{
    error::{Error, Result},
    seq_nr::Seqno,
};

/// When an entry has to be retransmitted. `None` means cancelled: never fire.
pub type Deadline = Option<Instant>;

#[derive(Debug, Clone, Copy)]
struct PqEle {
    seq_nr: Seqno,
    deadline: Deadline,
    // Breaks ties between equal deadlines, so they come out in FIFO order.
    order: u64,
}

impl PqEle {
    fn sorts_before(&self, other: &PqEle) -> bool {
        match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => (a, self.order) < (b, other.order),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.order < other.order,
        }
    }
}

#[derive(Default)]
pub struct RetryQueue {
    heap: Vec<PqEle>,
    index: HashMap<Seqno, usize>,
    next_order: u64,
    live: usize,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("len", &self.heap.len())
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl RetryQueue {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of entries that weren't cancelled.
    pub fn live_len(&self) -> usize {
        self.live
    }

    pub fn contains(&self, seq_nr: Seqno) -> bool {
        self.index.contains_key(&seq_nr)
    }

    pub fn deadline_of(&self, seq_nr: Seqno) -> Option<Deadline> {
        let idx = *self.index.get(&seq_nr)?;
        self.heap.get(idx).map(|e| e.deadline)
    }

    /// Schedule `seq_nr`. A queue never holds two entries for the same
    /// sequence number: inserting an existing one moves it to the new deadline.
    pub fn insert(&mut self, seq_nr: Seqno, deadline: Deadline) -> Result<()> {
        if self.index.contains_key(&seq_nr) {
            self.update(seq_nr, deadline)?;
            return Ok(());
        }
        let order = self.take_order();
        let idx = self.heap.len();
        self.heap.push(PqEle {
            seq_nr,
            deadline,
            order,
        });
        self.index.insert(seq_nr, idx);
        if deadline.is_some() {
            self.live += 1;
        }
        self.sift_up(idx);
        Ok(())
    }

    /// Move an existing entry to a new deadline. Returns false if there's no such entry.
    pub fn update(&mut self, seq_nr: Seqno, deadline: Deadline) -> Result<bool> {
        let idx = match self.locate(seq_nr)? {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let order = self.take_order();
        let e = &mut self.heap[idx];
        match (e.deadline.is_some(), deadline.is_some()) {
            (true, false) => self.live -= 1,
            (false, true) => self.live += 1,
            _ => {}
        }
        e.deadline = deadline;
        e.order = order;
        self.fix(idx);
        Ok(true)
    }

    /// Mark the entry as never firing. It stays in the queue until popped.
    pub fn cancel(&mut self, seq_nr: Seqno) -> Result<bool> {
        self.update(seq_nr, None)
    }

    pub fn peek(&self) -> Option<(Seqno, Deadline)> {
        self.heap.first().map(|e| (e.seq_nr, e.deadline))
    }

    /// Remove and return the earliest entry. If its deadline is `None`, every
    /// remaining entry is cancelled too.
    pub fn pop(&mut self) -> Option<(Seqno, Deadline)> {
        let e = self.remove_at(0)?;
        Some((e.seq_nr, e.deadline))
    }

    pub fn remove(&mut self, seq_nr: Seqno) -> Result<Option<Deadline>> {
        Ok(self
            .locate(seq_nr)?
            .and_then(|idx| self.remove_at(idx))
            .map(|e| e.deadline))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
        self.live = 0;
    }

    /// Drop all cancelled entries at once and rebuild the heap in O(n).
    pub fn purge_cancelled(&mut self) -> usize {
        let before = self.heap.len();
        self.heap.retain(|e| e.deadline.is_some());
        self.index.clear();
        for (i, e) in self.heap.iter().enumerate() {
            self.index.insert(e.seq_nr, i);
        }
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
        before - self.heap.len()
    }

    fn take_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    fn locate(&self, seq_nr: Seqno) -> Result<Option<usize>> {
        let idx = match self.index.get(&seq_nr) {
            Some(idx) => *idx,
            None => return Ok(None),
        };
        match self.heap.get(idx) {
            Some(e) if e.seq_nr == seq_nr => Ok(Some(idx)),
            _ => {
                error!(?seq_nr, idx, len = self.heap.len(), "retry queue index desync");
                Err(Error::BugHeapIndexDesync {
                    seq_nr,
                    mapped: idx,
                    len: self.heap.len(),
                })
            }
        }
    }

    fn remove_at(&mut self, idx: usize) -> Option<PqEle> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(idx, last);
        let e = self.heap.pop()?;
        self.index.remove(&e.seq_nr);
        if e.deadline.is_some() {
            self.live -= 1;
        }
        if idx < self.heap.len() {
            self.fix(idx);
        }
        Some(e)
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.heap[i].sorts_before(&self.heap[j])
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].seq_nr, i);
        self.index.insert(self.heap[j].seq_nr, j);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    // Returns true if the element moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.heap.len();
        let mut idx = start;
        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.less(right, left) {
                child = right;
            }
            if !self.less(child, idx) {
                break;
            }
            self.swap(idx, child);
            idx = child;
        }
        idx > start
    }

    fn fix(&mut self, idx: usize) {
        if !self.sift_down(idx) {
            self.sift_up(idx);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.heap.len(), self.index.len());
        for (i, e) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&e.seq_nr], i, "index desync for {:?}", e.seq_nr);
            if i > 0 {
                assert!(!self.less(i, (i - 1) / 2), "heap property broken at {i}");
            }
        }
        assert_eq!(
            self.live,
            self.heap.iter().filter(|e| e.deadline.is_some()).count()
        );
    }
}
