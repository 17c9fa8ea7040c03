//! Shared accumulation buffer and the rotation decision.

use std::time::{Duration, Instant};

use crate::storage::PersistableEvent;

/// A size rotation fires once the buffer exceeds the budget by this factor.
pub(crate) const ROTATION_MARGIN: f64 = 1.1;

/// Why a file was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// Accumulated footprint passed the size budget.
    Size,
    /// The oldest pending data reached the maximum file age.
    Age,
    /// Final drain at stop.
    Drain,
}

impl std::fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationTrigger::Size => write!(f, "size"),
            RotationTrigger::Age => write!(f, "age"),
            RotationTrigger::Drain => write!(f, "drain"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RotationLimits {
    pub max_file_bytes: u64,
    pub max_file_age: Duration,
}

impl RotationLimits {
    fn size_threshold(&self) -> u64 {
        (self.max_file_bytes as f64 * ROTATION_MARGIN) as u64
    }
}

/// Bookkeeping of the file currently being filled.
#[derive(Debug, Clone, Copy)]
pub struct RotationState {
    pub accumulated_bytes: u64,
    pub last_flush: Instant,
    pub next_sequence: u64,
}

/// Events taken out of the accumulator for one file.
#[derive(Debug)]
pub(crate) struct Extracted {
    pub events: Vec<PersistableEvent>,
    pub bytes: u64,
    pub sequence: u64,
    pub trigger: RotationTrigger,
}

/// Converted events waiting for the next rotation.
///
/// Lives behind the accumulation mutex; every method is O(1) apart from
/// the append, so the lock is never held across sorting or I/O.
#[derive(Debug)]
pub(crate) struct Accumulator {
    events: Vec<PersistableEvent>,
    state: RotationState,
}

impl Accumulator {
    pub fn new(now: Instant) -> Self {
        Self {
            events: Vec::new(),
            state: RotationState {
                accumulated_bytes: 0,
                last_flush: now,
                next_sequence: 0,
            },
        }
    }

    pub fn append(&mut self, events: &mut Vec<PersistableEvent>, bytes: u64) {
        self.events.append(events);
        self.state.accumulated_bytes += bytes;
    }

    /// Returns the rotation that is due, if any. Size wins over age.
    pub fn due(&self, limits: &RotationLimits, now: Instant) -> Option<RotationTrigger> {
        if self.state.accumulated_bytes > limits.size_threshold() {
            return Some(RotationTrigger::Size);
        }
        if !self.events.is_empty()
            && now.saturating_duration_since(self.state.last_flush) > limits.max_file_age
        {
            return Some(RotationTrigger::Age);
        }
        None
    }

    /// Swaps out the whole buffer and opens the next file.
    pub fn extract(&mut self, trigger: RotationTrigger, now: Instant) -> Extracted {
        let events = std::mem::take(&mut self.events);
        let bytes = std::mem::take(&mut self.state.accumulated_bytes);
        let sequence = self.state.next_sequence;
        self.state.next_sequence += 1;
        self.state.last_flush = now;
        Extracted {
            events,
            bytes,
            sequence,
            trigger,
        }
    }

    /// Returns carried-over events to the buffer for the next rotation.
    pub fn push_back(&mut self, mut events: Vec<PersistableEvent>, bytes: u64) {
        self.append(&mut events, bytes);
    }

    /// Restarts the age clock, e.g. when acquisition resumes after a pause.
    pub fn touch(&mut self, now: Instant) {
        self.state.last_flush = now;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn state(&self) -> RotationState {
        self.state
    }
}

/// Stable sort by timestamp. Equal timestamps keep arrival order.
pub(crate) fn sort_by_timestamp(events: &mut [PersistableEvent]) {
    events.sort_by(|a, b| a.timestamp_ns.total_cmp(&b.timestamp_ns));
}

/// Keeps the earliest events whose footprints fit in `budget` (at least one)
/// and returns the rest with their byte sum.
///
/// `events` must already be sorted.
pub(crate) fn split_to_budget(
    events: &mut Vec<PersistableEvent>,
    budget: u64,
) -> (Vec<PersistableEvent>, u64) {
    let mut used = 0u64;
    let mut keep = 0usize;
    for ev in events.iter() {
        let fp = ev.footprint();
        if keep > 0 && used + fp > budget {
            break;
        }
        used += fp;
        keep += 1;
    }
    let carry = events.split_off(keep.min(events.len()));
    let carry_bytes = carry.iter().map(PersistableEvent::footprint).sum();
    (carry, carry_bytes)
}
