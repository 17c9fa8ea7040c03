//! Per-channel statistics: energy histogram and probe traces.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::source::{ModuleLayout, Waveforms};
use crate::util::lock;

/// Scale applied to the first digital probe so it is visible next to ADC traces.
pub const DIGITAL1_SCALE: f64 = (16384 - 1000) as f64;
/// Scale applied to the second digital probe.
pub const DIGITAL2_SCALE: f64 = (16384 - 1500) as f64;

/// Fixed-range counting histogram with atomic bins.
///
/// Values outside `[min, max)` are counted in underflow/overflow.
#[derive(Debug)]
pub struct Histogram {
    min: f64,
    max: f64,
    bins: Box<[AtomicU64]>,
    underflow: AtomicU64,
    overflow: AtomicU64,
}

/// Point-in-time copy of a [`Histogram`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub min: f64,
    pub max: f64,
    pub bins: Vec<u64>,
    pub underflow: u64,
    pub overflow: u64,
}

impl HistogramSnapshot {
    /// Entries inside the range.
    pub fn entries(&self) -> u64 {
        self.bins.iter().sum()
    }
}

impl Histogram {
    pub fn new(bins: usize, min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            bins: (0..bins.max(1)).map(|_| AtomicU64::new(0)).collect(),
            underflow: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn fill(&self, value: f64) {
        if value.is_nan() || value < self.min {
            self.underflow.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if value >= self.max {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let n = self.bins.len();
        let idx = ((value - self.min) / (self.max - self.min) * n as f64) as usize;
        self.bins[idx.min(n - 1)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for bin in self.bins.iter() {
            bin.store(0, Ordering::Relaxed);
        }
        self.underflow.store(0, Ordering::Relaxed);
        self.overflow.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            min: self.min,
            max: self.max,
            bins: self.bins.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            underflow: self.underflow.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
        }
    }
}

/// The four probe traces of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSlot {
    Analog1,
    Analog2,
    Digital1,
    Digital2,
}

impl ProbeSlot {
    pub const ALL: [ProbeSlot; 4] = [
        ProbeSlot::Analog1,
        ProbeSlot::Analog2,
        ProbeSlot::Digital1,
        ProbeSlot::Digital2,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            ProbeSlot::Analog1 => "ap1",
            ProbeSlot::Analog2 => "ap2",
            ProbeSlot::Digital1 => "dp1",
            ProbeSlot::Digital2 => "dp2",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Points of one displayed trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Trace {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Trace {
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Statistics of one (module, channel).
#[derive(Debug)]
pub struct ChannelStat {
    pub histogram: Histogram,
    traces: [Mutex<Trace>; 4],
    snapshots: AtomicU64,
    sample_interval_ns: f64,
}

impl ChannelStat {
    pub fn new(histogram: Histogram, sample_interval_ns: u32) -> Self {
        Self {
            histogram,
            traces: Default::default(),
            snapshots: AtomicU64::new(0),
            sample_interval_ns: sample_interval_ns as f64,
        }
    }

    /// Overwrites all four traces with the probes of one event.
    ///
    /// Points are built outside the locks; each trace lock is held only for
    /// the swap.
    pub fn record_waveforms(&self, waveforms: &Waveforms) {
        let dt = self.sample_interval_ns;
        let x: Vec<f64> = (0..waveforms.analog1.len()).map(|i| i as f64 * dt).collect();

        let ys = [
            waveforms.analog1.samples.iter().map(|&s| s as f64).collect(),
            waveforms.analog2.samples.iter().map(|&s| s as f64).collect(),
            waveforms
                .digital1
                .samples
                .iter()
                .map(|&s| s as f64 * DIGITAL1_SCALE)
                .collect(),
            waveforms
                .digital2
                .samples
                .iter()
                .map(|&s| s as f64 * DIGITAL2_SCALE)
                .collect::<Vec<f64>>(),
        ];
        for (slot, y) in ProbeSlot::ALL.into_iter().zip(ys) {
            let mut fresh = Trace { x: x.clone(), y };
            std::mem::swap(&mut *lock(&self.traces[slot.index()]), &mut fresh);
        }
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of a trace taken under its lock.
    pub fn trace(&self, slot: ProbeSlot) -> Trace {
        lock(&self.traces[slot.index()]).clone()
    }

    /// Number of waveform snapshots taken so far.
    pub fn snapshot_count(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }
}

/// Histogram binning shared by all channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSpec {
    pub bins: usize,
    pub min: f64,
    pub max: f64,
}

impl Default for HistogramSpec {
    fn default() -> Self {
        Self {
            bins: 30_000,
            min: 0.0,
            max: 30_000.0,
        }
    }
}

/// Channel statistics keyed by (module, channel). Fixed after construction.
pub type ChannelMap = BTreeMap<(u8, u8), ChannelStat>;

/// Allocates one [`ChannelStat`] per channel of every module in `topology`.
pub fn build_channel_map(topology: &[ModuleLayout], spec: HistogramSpec) -> ChannelMap {
    let mut map = BTreeMap::new();
    for layout in topology {
        for ch in 0..layout.channels.min(256) {
            map.insert(
                (layout.module, ch as u8),
                ChannelStat::new(
                    Histogram::new(spec.bins, spec.min, spec.max),
                    layout.sample_interval_ns,
                ),
            );
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Probe;

    #[test]
    fn test_histogram_binning_and_overflow() {
        let h = Histogram::new(10, 0.0, 100.0);
        h.fill(0.0);
        h.fill(9.99);
        h.fill(55.0);
        h.fill(99.9);
        h.fill(100.0);
        h.fill(-1.0);
        h.fill(f64::NAN);

        let s = h.snapshot();
        assert_eq!(s.bins[0], 2);
        assert_eq!(s.bins[5], 1);
        assert_eq!(s.bins[9], 1);
        assert_eq!(s.entries(), 4);
        assert_eq!(s.overflow, 1);
        assert_eq!(s.underflow, 2);

        h.reset();
        let s = h.snapshot();
        assert_eq!(s.entries() + s.overflow + s.underflow, 0);
    }

    #[test]
    fn test_default_binning_is_unit_width() {
        let spec = HistogramSpec::default();
        let h = Histogram::new(spec.bins, spec.min, spec.max);
        h.fill(6620.0);
        h.fill(29_999.0);
        let s = h.snapshot();
        assert_eq!(s.bins[6620], 1);
        assert_eq!(s.bins[29_999], 1);
    }

    #[test]
    fn test_traces_scaled_and_overwritten() {
        let stat = ChannelStat::new(Histogram::new(4, 0.0, 4.0), 4);
        let wf = |base: i32| Waveforms {
            analog1: Probe::new(0, vec![base, base + 1, base + 2]),
            analog2: Probe::new(1, vec![0, -1, 0]),
            digital1: Probe::new(2, vec![0, 1, 1]),
            digital2: Probe::new(3, vec![1, 0, 0]),
        };

        stat.record_waveforms(&wf(100));
        stat.record_waveforms(&wf(200));

        let ap1 = stat.trace(ProbeSlot::Analog1);
        assert_eq!(ap1.x, vec![0.0, 4.0, 8.0]);
        assert_eq!(ap1.y, vec![200.0, 201.0, 202.0]);
        assert_eq!(stat.trace(ProbeSlot::Digital1).y, vec![0.0, 15384.0, 15384.0]);
        assert_eq!(stat.trace(ProbeSlot::Digital2).y[0], 14884.0);
        assert_eq!(stat.snapshot_count(), 2);
    }

    #[test]
    fn test_channel_map_from_topology() {
        let topology = [
            ModuleLayout {
                module: 0,
                channels: 16,
                sample_interval_ns: 4,
            },
            ModuleLayout {
                module: 3,
                channels: 2,
                sample_interval_ns: 2,
            },
        ];
        let map = build_channel_map(&topology, HistogramSpec::default());
        assert_eq!(map.len(), 18);
        assert!(map.contains_key(&(3, 1)));
        assert!(!map.contains_key(&(3, 2)));
        assert!(!map.contains_key(&(1, 0)));
    }
}
