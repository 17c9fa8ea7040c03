//! The persisted form of an event.

use serde::{Deserialize, Serialize};

use crate::source::RawEvent;

/// Bytes accounted per event without waveform: module, channel, timestamp,
/// long and short energy.
pub const EVENT_HEADER_BYTES: u64 = 1 + 1 + 8 + 2 + 2;

/// Bytes accounted per waveform sample.
pub const SAMPLE_BYTES: u64 = 4;

/// Storage footprint of an event carrying `waveform_size` samples.
pub fn footprint_of(waveform_size: usize) -> u64 {
    EVENT_HEADER_BYTES + SAMPLE_BYTES * waveform_size as u64
}

/// An event as written to a record file.
///
/// Only the first analog probe is kept as the waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistableEvent {
    pub module: u8,
    pub channel: u8,
    pub timestamp_ns: f64,
    pub energy_long: u16,
    pub energy_short: i16,
    pub waveform: Vec<i32>,
}

impl PersistableEvent {
    pub fn from_raw(event: &RawEvent) -> Self {
        let size = event.waveform_size();
        let waveform = event
            .waveforms()
            .map(|w| w.analog1.samples.iter().take(size).copied().collect())
            .unwrap_or_default();
        Self {
            module: event.module,
            channel: event.channel,
            timestamp_ns: event.fine_timestamp_ns,
            energy_long: event.energy_long,
            energy_short: event.energy_short,
            waveform,
        }
    }

    /// Bytes this event counts against the file size budget.
    pub fn footprint(&self) -> u64 {
        footprint_of(self.waveform.len())
    }
}
