//! Raw digitizer events as handed out by an [`EventSource`](super::EventSource).

use std::sync::Arc;

use super::SourceError;

/// An owned batch of events from one poll/drain cycle.
pub type EventBatch = Vec<RawEvent>;

/// Immutable handle to a batch shared between consumers.
///
/// The aggregator hands one batch to both the recorder and the monitor;
/// sharing the allocation avoids copying waveform payloads.
pub type SharedBatch = Arc<EventBatch>;

/// One auxiliary waveform channel captured with an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Probe<T> {
    /// Device-defined tag describing which signal the probe carries.
    pub kind: i32,
    pub samples: Vec<T>,
}

impl<T> Probe<T> {
    pub fn new(kind: i32, samples: Vec<T>) -> Self {
        Self { kind, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The four probe traces of an event. All traces have the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveforms {
    pub analog1: Probe<i32>,
    pub analog2: Probe<i32>,
    pub digital1: Probe<u8>,
    pub digital2: Probe<u8>,
}

impl Waveforms {
    fn uniform_len(&self) -> Option<usize> {
        let n = self.analog1.len();
        (self.analog2.len() == n && self.digital1.len() == n && self.digital2.len() == n)
            .then_some(n)
    }
}

/// A single hit as read out of a digitizer.
///
/// Immutable once produced. Waveforms are optional; when present every probe
/// carries exactly [`RawEvent::waveform_size`] samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    pub module: u8,
    pub channel: u8,
    pub coarse_timestamp: u64,
    /// Fine timestamp in nanoseconds (includes the interpolated fraction).
    pub fine_timestamp_ns: f64,
    pub energy_long: u16,
    /// Short-gate integral; 0 for firmware without short integration.
    pub energy_short: i16,
    pub flags: u64,
    waveforms: Option<Box<Waveforms>>,
}

impl RawEvent {
    pub fn new(
        module: u8,
        channel: u8,
        coarse_timestamp: u64,
        fine_timestamp_ns: f64,
        energy_long: u16,
    ) -> Self {
        Self {
            module,
            channel,
            coarse_timestamp,
            fine_timestamp_ns,
            energy_long,
            ..Self::default()
        }
    }

    pub fn with_energy_short(mut self, energy_short: i16) -> Self {
        self.energy_short = energy_short;
        self
    }

    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    /// Attaches probe traces. Fails if the four traces differ in length.
    /// Zero-length traces are treated as "no waveform".
    pub fn with_waveforms(mut self, waveforms: Waveforms) -> Result<Self, SourceError> {
        let len = waveforms.uniform_len().ok_or_else(|| {
            SourceError::Malformed(format!(
                "module {} channel {}: probe lengths differ ({}, {}, {}, {})",
                self.module,
                self.channel,
                waveforms.analog1.len(),
                waveforms.analog2.len(),
                waveforms.digital1.len(),
                waveforms.digital2.len()
            ))
        })?;
        self.waveforms = (len > 0).then(|| Box::new(waveforms));
        Ok(self)
    }

    /// Number of samples per probe, 0 when waveform capture was off.
    pub fn waveform_size(&self) -> usize {
        self.waveforms.as_ref().map_or(0, |w| w.analog1.len())
    }

    pub fn waveforms(&self) -> Option<&Waveforms> {
        self.waveforms.as_deref()
    }

    pub fn timestamp_ns(&self) -> f64 {
        self.fine_timestamp_ns
    }
}
