//! Monitoring engine: live energy histograms and probe traces.
//!
//! A pool of filling threads consumes submitted batches and updates the
//! per-channel statistics; a separate UI pump snapshots them at a fixed
//! period into a [`VisualizationSink`]. The pump only reads statistics.
//!
//! Histograms accumulate every event of a known (module, channel). Traces
//! are overwritten with the first waveform event of each channel in a batch,
//! so a channel gets at most one trace snapshot per batch.

mod sink;
mod stats;

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

pub use sink::{Series, SeriesBoard, SeriesData, VisualizationSink};
pub use stats::{
    ChannelMap, ChannelStat, DIGITAL1_SCALE, DIGITAL2_SCALE, Histogram, HistogramSnapshot,
    HistogramSpec, ProbeSlot, Trace, build_channel_map,
};

use crate::source::{ModuleLayout, RawEvent, SharedBatch};
use crate::util::{lock, sleep_while_running};

/// Tunables of the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub filling_threads: usize,
    /// Period of the UI pump.
    pub ui_period: Duration,
    /// Idle sleep of the filling threads.
    pub poll_interval: Duration,
    pub histogram: HistogramSpec,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            filling_threads: 4,
            ui_period: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
            histogram: HistogramSpec::default(),
        }
    }
}

#[derive(Debug)]
pub enum MonitorError {
    AlreadyRunning,
    NotConfigured,
    InvalidConfig(String),
    Spawn(io::Error),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::AlreadyRunning => write!(f, "monitor is already running"),
            MonitorError::NotConfigured => write!(f, "monitor is not configured"),
            MonitorError::InvalidConfig(msg) => write!(f, "invalid monitor config: {}", msg),
            MonitorError::Spawn(e) => write!(f, "failed to spawn monitor worker: {}", e),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Monitor counters since the last `configure()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub batches: u64,
    pub events: u64,
    /// Events whose (module, channel) is not part of the topology.
    pub unknown_events: u64,
    pub trace_snapshots: u64,
    pub frames_published: u64,
}

pub fn histogram_id(module: u8, channel: u8) -> String {
    format!("hist_{:02}_{:02}", module, channel)
}

pub fn trace_id(module: u8, channel: u8, slot: ProbeSlot) -> String {
    format!("trace_{:02}_{:02}_{}", module, channel, slot.suffix())
}

pub fn module_path(module: u8) -> String {
    format!("/Module{:02}", module)
}

struct Shared {
    channels: ChannelMap,
    queue: Mutex<VecDeque<SharedBatch>>,
    running: AtomicBool,
    batches: AtomicU64,
    events: AtomicU64,
    unknown_events: AtomicU64,
    trace_snapshots: AtomicU64,
    frames: AtomicU64,
}

impl Shared {
    fn fill(&self, batch: &[RawEvent]) {
        let mut traced: BTreeSet<(u8, u8)> = BTreeSet::new();
        let mut unknown = 0u64;
        for ev in batch {
            let key = (ev.module, ev.channel);
            let Some(stat) = self.channels.get(&key) else {
                unknown += 1;
                continue;
            };
            stat.histogram.fill(ev.energy_long as f64);
            if let Some(waveforms) = ev.waveforms()
                && traced.insert(key)
            {
                stat.record_waveforms(waveforms);
            }
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.unknown_events.fetch_add(unknown, Ordering::Relaxed);
        self.trace_snapshots
            .fetch_add(traced.len() as u64, Ordering::Relaxed);
    }

    /// Copies every histogram and trace into the sink and commits the frame.
    fn publish(&self, sink: &dyn VisualizationSink) {
        for (&(module, channel), stat) in &self.channels {
            sink.publish_histogram(&histogram_id(module, channel), &stat.histogram.snapshot());
            for slot in ProbeSlot::ALL {
                let trace = stat.trace(slot);
                if !trace.is_empty() {
                    sink.publish_trace(&trace_id(module, channel, slot), &trace.x, &trace.y);
                }
            }
        }
        if let Err(e) = sink.commit() {
            warn!(error = %e, "visualization commit failed");
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> MonitorStats {
        MonitorStats {
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            trace_snapshots: self.trace_snapshots.load(Ordering::Relaxed),
            frames_published: self.frames.load(Ordering::Relaxed),
        }
    }
}

fn filling_loop(shared: Arc<Shared>, interval: Duration) {
    while shared.running.load(Ordering::Acquire) {
        let batch = lock(&shared.queue).pop_front();
        match batch {
            Some(batch) => shared.fill(&batch),
            None => thread::sleep(interval),
        }
    }
}

fn pump_loop(shared: Arc<Shared>, sink: Arc<dyn VisualizationSink>, period: Duration, step: Duration) {
    loop {
        sleep_while_running(&shared.running, period, step.max(Duration::from_millis(10)));
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        shared.publish(sink.as_ref());
    }
}

/// Owns the filling pool, the UI pump and the channel statistics.
pub struct MonitoringEngine {
    config: MonitorConfig,
    sink: Arc<dyn VisualizationSink>,
    shared: Option<Arc<Shared>>,
    workers: Vec<JoinHandle<()>>,
    /// Events submitted before the first `configure`.
    unconfigured_drops: AtomicU64,
}

impl MonitoringEngine {
    pub fn new(config: MonitorConfig, sink: Arc<dyn VisualizationSink>) -> Self {
        Self {
            config,
            sink,
            shared: None,
            workers: Vec::new(),
            unconfigured_drops: AtomicU64::new(0),
        }
    }

    /// Events dropped because they arrived before `configure`.
    pub fn unconfigured_drops(&self) -> u64 {
        self.unconfigured_drops.load(Ordering::Relaxed)
    }

    /// Allocates statistics for every channel in the topology and registers
    /// their series with the sink. Previous statistics are discarded.
    pub fn configure(&mut self, topology: &[ModuleLayout]) -> Result<(), MonitorError> {
        if self.is_running() {
            return Err(MonitorError::AlreadyRunning);
        }
        let spec = self.config.histogram;
        if spec.bins == 0 || !(spec.max > spec.min) {
            return Err(MonitorError::InvalidConfig(format!(
                "histogram of {} bins over [{}, {})",
                spec.bins, spec.min, spec.max
            )));
        }
        if self.config.filling_threads == 0 {
            return Err(MonitorError::InvalidConfig(
                "at least one filling thread required".to_string(),
            ));
        }

        let channels = build_channel_map(topology, spec);
        for &(module, channel) in channels.keys() {
            let path = module_path(module);
            self.sink
                .register_series(&path, &histogram_id(module, channel));
            for slot in ProbeSlot::ALL {
                self.sink
                    .register_series(&path, &trace_id(module, channel, slot));
            }
        }
        info!(
            modules = topology.len(),
            channels = channels.len(),
            "monitor configured"
        );
        self.shared = Some(Arc::new(Shared {
            channels,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            batches: AtomicU64::new(0),
            events: AtomicU64::new(0),
            unknown_events: AtomicU64::new(0),
            trace_snapshots: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        }));
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), MonitorError> {
        let shared = self.shared.clone().ok_or(MonitorError::NotConfigured)?;
        if self.is_running() {
            return Err(MonitorError::AlreadyRunning);
        }
        shared.running.store(true, Ordering::Release);

        for i in 0..self.config.filling_threads {
            let s = Arc::clone(&shared);
            let interval = self.config.poll_interval;
            let spawned = thread::Builder::new()
                .name(format!("mon-fill-{}", i))
                .spawn(move || filling_loop(s, interval));
            self.push_worker(spawned)?;
        }

        let s = Arc::clone(&shared);
        let sink = Arc::clone(&self.sink);
        let period = self.config.ui_period;
        let step = self.config.poll_interval;
        let spawned = thread::Builder::new()
            .name("mon-ui".to_string())
            .spawn(move || pump_loop(s, sink, period, step));
        self.push_worker(spawned)?;

        debug!(workers = self.workers.len(), "monitor started");
        Ok(())
    }

    fn push_worker(&mut self, spawned: io::Result<JoinHandle<()>>) -> Result<(), MonitorError> {
        match spawned {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to spawn monitor worker");
                self.stop();
                Err(MonitorError::Spawn(e))
            }
        }
    }

    /// Enqueues a batch for the filling pool. Non-blocking.
    pub fn submit(&self, batch: SharedBatch) {
        match &self.shared {
            Some(shared) => lock(&shared.queue).push_back(batch),
            None => {
                let before = self
                    .unconfigured_drops
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                if before == 0 {
                    warn!(events = batch.len(), "monitor not configured, dropping batches");
                }
            }
        }
    }

    /// Clears every histogram. Traces are left as they are.
    pub fn reset_statistics(&self) {
        if let Some(shared) = &self.shared {
            for stat in shared.channels.values() {
                stat.histogram.reset();
            }
            info!("monitor statistics reset");
        }
    }

    /// Joins all workers, fills what is still queued and publishes one last frame.
    pub fn stop(&mut self) -> MonitorStats {
        let Some(shared) = self.shared.clone() else {
            return MonitorStats::default();
        };
        shared.running.store(false, Ordering::Release);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("monitor worker panicked");
            }
        }

        let pending: Vec<SharedBatch> = lock(&shared.queue).drain(..).collect();
        for batch in &pending {
            shared.fill(batch);
        }
        shared.publish(self.sink.as_ref());

        let stats = shared.stats();
        info!(
            batches = stats.batches,
            events = stats.events,
            unknown = stats.unknown_events,
            "monitor stopped"
        );
        stats
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> MonitorStats {
        self.shared
            .as_ref()
            .map(|s| s.stats())
            .unwrap_or_default()
    }

    pub fn histogram(&self, module: u8, channel: u8) -> Option<HistogramSnapshot> {
        let shared = self.shared.as_ref()?;
        Some(shared.channels.get(&(module, channel))?.histogram.snapshot())
    }

    pub fn trace(&self, module: u8, channel: u8, slot: ProbeSlot) -> Option<Trace> {
        let shared = self.shared.as_ref()?;
        Some(shared.channels.get(&(module, channel))?.trace(slot))
    }

    /// Waveform snapshots taken for one channel.
    pub fn trace_snapshots(&self, module: u8, channel: u8) -> Option<u64> {
        let shared = self.shared.as_ref()?;
        Some(shared.channels.get(&(module, channel))?.snapshot_count())
    }
}

impl Drop for MonitoringEngine {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::event;
    use std::time::Instant;

    fn topology() -> Vec<ModuleLayout> {
        vec![
            ModuleLayout {
                module: 0,
                channels: 2,
                sample_interval_ns: 4,
            },
            ModuleLayout {
                module: 1,
                channels: 1,
                sample_interval_ns: 2,
            },
        ]
    }

    fn engine(board: &Arc<SeriesBoard>, ui_ms: u64) -> MonitoringEngine {
        let config = MonitorConfig {
            filling_threads: 2,
            ui_period: Duration::from_millis(ui_ms),
            ..MonitorConfig::default()
        };
        let mut mon = MonitoringEngine::new(config, Arc::clone(board) as Arc<dyn VisualizationSink>);
        mon.configure(&topology()).unwrap();
        mon
    }

    #[test]
    fn test_submit_before_configure_is_counted() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = MonitoringEngine::new(MonitorConfig::default(), Arc::clone(&board) as Arc<dyn VisualizationSink>);
        mon.submit(Arc::new(vec![event(0, 0, 1.0, 0), event(0, 1, 2.0, 0)]));
        assert_eq!(mon.unconfigured_drops(), 2);

        mon.configure(&topology()).unwrap();
        mon.submit(Arc::new(vec![event(0, 0, 3.0, 0)]));
        assert_eq!(mon.unconfigured_drops(), 2);
    }

    #[test]
    fn test_series_registered_per_channel() {
        let board = Arc::new(SeriesBoard::new());
        let _mon = engine(&board, 500);
        assert_eq!(board.series_ids().len(), 3 * 5);
        assert_eq!(board.series("hist_01_00").unwrap().path, "/Module01");
        assert!(board.series("trace_00_01_dp2").is_some());
        assert!(board.series("hist_01_01").is_none());
    }

    #[test]
    fn test_one_trace_snapshot_per_channel_per_batch() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = engine(&board, 500);
        let batch = vec![
            event(0, 0, 1.0, 8),
            event(0, 0, 2.0, 16),
            event(0, 1, 3.0, 8),
            event(0, 1, 4.0, 0),
            event(1, 0, 5.0, 0),
        ];
        mon.submit(Arc::new(batch.clone()));
        mon.submit(Arc::new(batch));
        let stats = mon.stop();

        assert_eq!(stats.trace_snapshots, 4);
        assert_eq!(mon.trace_snapshots(0, 0), Some(2));
        assert_eq!(mon.trace_snapshots(0, 1), Some(2));
        assert_eq!(mon.trace_snapshots(1, 0), Some(0));
        // The first waveform of the batch wins, later ones are skipped.
        assert_eq!(mon.trace(0, 0, ProbeSlot::Analog1).unwrap().x.len(), 8);
    }

    #[test]
    fn test_histograms_count_every_known_event() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = engine(&board, 500);
        mon.start().unwrap();
        for i in 0..20 {
            mon.submit(Arc::new(vec![event(0, 1, i as f64, 0), event(9, 0, i as f64, 0)]));
        }
        let stats = mon.stop();

        assert_eq!(stats.events, 40);
        assert_eq!(stats.unknown_events, 20);
        // `event()` sets energy 100 + channel.
        let hist = mon.histogram(0, 1).unwrap();
        assert_eq!(hist.bins[101], 20);
        assert_eq!(hist.entries(), 20);

        let published = board.histogram("hist_00_01").unwrap();
        assert_eq!(published.bins[101], 20);
    }

    #[test]
    fn test_trace_published_with_sample_interval() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = engine(&board, 500);
        mon.submit(Arc::new(vec![event(1, 0, 0.0, 3)]));
        mon.stop();

        let (x, y) = board.trace("trace_01_00_ap1").unwrap();
        assert_eq!(x, vec![0.0, 2.0, 4.0]);
        assert_eq!(y, vec![0.0, 1.0, 2.0]);
        let (_, dp1) = board.trace("trace_01_00_dp1").unwrap();
        assert_eq!(dp1, vec![DIGITAL1_SCALE; 3]);
    }

    #[test]
    fn test_reset_clears_histograms_keeps_traces() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = engine(&board, 500);
        mon.submit(Arc::new(vec![event(0, 0, 0.0, 4)]));
        mon.stop();
        assert_eq!(mon.histogram(0, 0).unwrap().entries(), 1);

        mon.reset_statistics();
        assert_eq!(mon.histogram(0, 0).unwrap().entries(), 0);
        assert_eq!(mon.trace(0, 0, ProbeSlot::Analog2).unwrap().y.len(), 4);
    }

    #[test]
    fn test_ui_pump_publishes_periodically() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = engine(&board, 20);
        mon.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while board.frames() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(board.frames() >= 3);
        let stats = mon.stop();
        assert!(stats.frames_published >= 4);
    }

    #[test]
    fn test_control_errors() {
        let board = Arc::new(SeriesBoard::new());
        let mut mon = MonitoringEngine::new(
            MonitorConfig::default(),
            Arc::clone(&board) as Arc<dyn VisualizationSink>,
        );
        assert!(matches!(mon.start(), Err(MonitorError::NotConfigured)));
        mon.configure(&topology()).unwrap();
        mon.start().unwrap();
        assert!(matches!(mon.start(), Err(MonitorError::AlreadyRunning)));
        assert!(matches!(
            mon.configure(&topology()),
            Err(MonitorError::AlreadyRunning)
        ));
        mon.stop();
    }
}
