//! Sequence table
//!
//! Tracks live URBs by seqnum and remembers recently retired seqnums so
//! duplicate completions are absorbed. The host layer may deliver a
//! completion for a transfer whose cancellation was already acknowledged;
//! without the recent set the server would emit two RET_SUBMITs for one
//! seqnum.
//!
//! The recent set is an idempotency filter, not a cache: a bounded queue
//! drives eviction, a hash set answers membership in O(1).

use std::collections::{HashMap, HashSet, VecDeque};

use super::urb::{UrbRecord, UrbState};

/// Eviction bound on the recently-retired set
pub const RECENT_CAPACITY: usize = 1000;

/// Why an insert was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// seqnum is live or recently retired
    Duplicate,
    /// In-flight cap reached
    Full,
}

pub struct SequenceTable {
    live: HashMap<u32, UrbRecord>,
    recent: VecDeque<u32>,
    recent_set: HashSet<u32>,
    max_live: usize,
}

impl SequenceTable {
    /// `max_live` caps concurrently in-flight URBs.
    pub fn new(max_live: usize) -> Self {
        Self {
            live: HashMap::with_capacity(max_live),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            recent_set: HashSet::with_capacity(RECENT_CAPACITY),
            max_live,
        }
    }

    /// Register a URB. Refuses duplicates of live or recently retired
    /// seqnums, and refuses past the in-flight cap.
    pub fn insert(&mut self, urb: UrbRecord) -> Result<(), InsertError> {
        if self.live.contains_key(&urb.seqnum) || self.recent_set.contains(&urb.seqnum) {
            return Err(InsertError::Duplicate);
        }
        if self.live.len() >= self.max_live {
            return Err(InsertError::Full);
        }
        self.live.insert(urb.seqnum, urb);
        Ok(())
    }

    /// Remove a live URB for completion and retire its seqnum.
    pub fn take(&mut self, seqnum: u32) -> Option<UrbRecord> {
        let urb = self.live.remove(&seqnum)?;
        self.remember(seqnum);
        Some(urb)
    }

    /// Detach a URB ahead of cancellation. The seqnum is retired
    /// immediately so the transfer's eventual completion finds nothing.
    pub fn mark_unlinked(&mut self, seqnum: u32) -> Option<UrbRecord> {
        let mut urb = self.live.remove(&seqnum)?;
        urb.state = UrbState::Unlinked;
        self.remember(seqnum);
        Some(urb)
    }

    pub fn contains_recent(&self, seqnum: u32) -> bool {
        self.recent_set.contains(&seqnum)
    }

    pub fn is_live(&self, seqnum: u32) -> bool {
        self.live.contains_key(&seqnum)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Retire a seqnum that never made it into the live map, so a
    /// retransmission of a rejected SUBMIT is not answered twice.
    pub fn remember(&mut self, seqnum: u32) {
        if !self.recent_set.insert(seqnum) {
            return;
        }
        self.recent.push_front(seqnum);
        while self.recent.len() > RECENT_CAPACITY {
            if let Some(evicted) = self.recent.pop_back() {
                self.recent_set.remove(&evicted);
            }
        }
    }

    /// Remove every live URB, for connection teardown. The caller requests
    /// cancellation for each; completions then resolve to nothing.
    pub fn drain(&mut self) -> Vec<UrbRecord> {
        self.live.drain().map(|(_, urb)| urb).collect()
    }
}
