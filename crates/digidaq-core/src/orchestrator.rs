//! Wiring of the aggregator and the two consumer engines.
//!
//! The orchestrator owns no threads itself. The caller drives [`Orchestrator::route`]
//! from its main loop; each call moves everything acquired so far into one
//! shared batch handed to both consumers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::acquisition::{AcquisitionAggregator, AcquisitionConfig, AcquisitionStats};
use crate::monitor::{MonitorConfig, MonitorError, MonitorStats, MonitoringEngine, VisualizationSink};
use crate::recording::{RecordError, RecordingConfig, RecordingEngine, RecordingStats};
use crate::source::{EventSource, SourceConfig, SourceError};
use crate::storage::RecordSink;

#[derive(Debug)]
pub enum PipelineError {
    Source(SourceError),
    Record(RecordError),
    Monitor(MonitorError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Source(e) => write!(f, "acquisition: {}", e),
            PipelineError::Record(e) => write!(f, "recording: {}", e),
            PipelineError::Monitor(e) => write!(f, "monitor: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Source(e) => Some(e),
            PipelineError::Record(e) => Some(e),
            PipelineError::Monitor(e) => Some(e),
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        PipelineError::Source(e)
    }
}

impl From<RecordError> for PipelineError {
    fn from(e: RecordError) -> Self {
        PipelineError::Record(e)
    }
}

impl From<MonitorError> for PipelineError {
    fn from(e: MonitorError) -> Self {
        PipelineError::Monitor(e)
    }
}

/// Settings of the three engines. `recording: None` runs monitor-only.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub acquisition: AcquisitionConfig,
    pub recording: Option<RecordingConfig>,
    pub monitor: MonitorConfig,
}

/// Totals of one run, returned by [`Orchestrator::stop`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub routed_events: u64,
    pub routed_batches: u64,
    pub elapsed: Duration,
    /// Routed events per second of run time.
    pub event_rate: f64,
    pub acquisition: AcquisitionStats,
    pub recording: Option<RecordingStats>,
    pub monitor: MonitorStats,
}

pub struct Orchestrator {
    acquisition: AcquisitionAggregator,
    recording: Option<RecordingEngine>,
    monitoring: MonitoringEngine,
    routed_events: u64,
    routed_batches: u64,
    started_at: Option<Instant>,
    active: Duration,
}

impl Orchestrator {
    /// Installs and opens the sources, then configures both consumers.
    ///
    /// Any error here is a configuration fault.
    pub fn open(
        config: PipelineConfig,
        sources: Vec<Box<dyn EventSource>>,
        source_configs: &[SourceConfig],
        record_sink: Arc<dyn RecordSink>,
        vis_sink: Arc<dyn VisualizationSink>,
    ) -> Result<Self, PipelineError> {
        let mut acquisition = AcquisitionAggregator::new(config.acquisition);
        acquisition.configure(sources)?;
        acquisition.open(source_configs)?;

        let recording = match config.recording {
            Some(rec_config) => {
                let mut engine = RecordingEngine::new(record_sink);
                engine.configure(rec_config)?;
                Some(engine)
            }
            None => None,
        };

        let mut monitoring = MonitoringEngine::new(config.monitor, vis_sink);
        monitoring.configure(&acquisition.topology())?;

        Ok(Self {
            acquisition,
            recording,
            monitoring,
            routed_events: 0,
            routed_batches: 0,
            started_at: None,
            active: Duration::ZERO,
        })
    }

    /// Starts consumers first, then acquisition.
    ///
    /// A consumer that fails to start is logged and skipped; the first such
    /// error is returned after everything else was started.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let mut first: Option<PipelineError> = None;
        if let Some(rec) = &mut self.recording
            && let Err(e) = rec.start()
        {
            error!(error = %e, "recording failed to start");
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.monitoring.start() {
            error!(error = %e, "monitor failed to start");
            first.get_or_insert(e.into());
        }
        self.acquisition.start();
        self.started_at = Some(Instant::now());
        info!("pipeline started");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Moves everything acquired so far to both consumers. Returns the number
    /// of events routed.
    pub fn route(&mut self) -> usize {
        let batch = self.acquisition.take_all();
        if batch.is_empty() {
            return 0;
        }
        let n = batch.len();
        let shared = Arc::new(batch);
        if let Some(rec) = &self.recording {
            rec.submit(Arc::clone(&shared));
        }
        self.monitoring.submit(shared);
        self.routed_events += n as u64;
        self.routed_batches += 1;
        n
    }

    /// Applies new source configs without losing events.
    ///
    /// Acquisition stops and its tail is routed; both consumers drain and stop;
    /// sources are reconfigured; everything restarts. The recording sequence
    /// continues and histograms are cleared.
    pub fn reload(&mut self, configs: &[SourceConfig]) -> Result<(), PipelineError> {
        info!(sources = configs.len(), "reloading configuration");
        let topology_before = self.acquisition.topology();

        self.pause();

        let result = self.acquisition.reconfigure(configs);
        if let Err(e) = &result {
            error!(error = %e, "source reconfiguration failed, restarting with previous settings");
        }

        let topology = self.acquisition.topology();
        if topology == topology_before {
            self.monitoring.reset_statistics();
        } else if let Err(e) = self.monitoring.configure(&topology) {
            error!(error = %e, "monitor reconfiguration failed");
        }

        let restarted = self.start();
        result?;
        restarted
    }

    /// Stops everything with a final drain and returns the run totals.
    pub fn stop(&mut self) -> RunSummary {
        self.pause();
        let elapsed = self.active;
        let event_rate = if elapsed.as_secs_f64() > 0.0 {
            self.routed_events as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        RunSummary {
            routed_events: self.routed_events,
            routed_batches: self.routed_batches,
            elapsed,
            event_rate,
            acquisition: self.acquisition.stats(),
            recording: self.recording.as_ref().map(RecordingEngine::stats),
            monitor: self.monitoring.stats(),
        }
    }

    /// Stops if needed and closes every source.
    pub fn close(mut self) -> RunSummary {
        let summary = self.stop();
        self.acquisition.close();
        summary
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn monitoring(&self) -> &MonitoringEngine {
        &self.monitoring
    }

    pub fn recording(&self) -> Option<&RecordingEngine> {
        self.recording.as_ref()
    }

    pub fn acquisition(&self) -> &AcquisitionAggregator {
        &self.acquisition
    }

    /// Orderly stop: acquisition, tail routing, then both consumers with drain.
    fn pause(&mut self) {
        self.acquisition.stop();
        self.route();
        self.monitoring.stop();
        if let Some(rec) = &mut self.recording {
            let stats = rec.stop();
            for fault in &stats.faults {
                warn!(file = %fault.file.display(), events = fault.events, cause = %fault.cause, "unwritten record file");
            }
        }
        if let Some(started) = self.started_at.take() {
            self.active += started.elapsed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SeriesBoard;
    use crate::source::testing::{ScriptedSource, event};
    use crate::source::{EventBatch, Firmware};
    use crate::storage::{ChunkFileSink, RecordReader};
    use std::path::Path;
    use std::thread;
    use tempfile::tempdir;

    fn source_config(module: u32, channels: u32) -> SourceConfig {
        SourceConfig {
            url: format!("scripted://{}", module),
            firmware: Firmware::Psd,
            module_id: module,
            serial_number: None,
            channels,
            sample_rate_msps: 250,
            record_length: 8,
            waveforms: true,
            event_rate_hz: 0.0,
            seed: None,
            parameters: serde_json::Value::Null,
        }
    }

    fn batch(module: u8, from: usize, n: usize) -> EventBatch {
        (from..from + n)
            .map(|i| event(module, (i % 2) as u8, i as f64 * 10.0 + module as f64, 8))
            .collect()
    }

    fn pipeline(dir: &Path, record: bool) -> (Orchestrator, Arc<SeriesBoard>) {
        let sources: Vec<Box<dyn EventSource>> = vec![
            Box::new(ScriptedSource::new(0, 2).push(batch(0, 0, 50)).push(batch(0, 50, 50))),
            Box::new(ScriptedSource::new(1, 2).push(batch(1, 0, 30)).with_tail(batch(1, 30, 5))),
        ];
        let config = PipelineConfig {
            recording: record.then(|| RecordingConfig {
                file_prefix: dir.join("run").to_string_lossy().into_owned(),
                max_file_bytes: 1_000,
                ..RecordingConfig::default()
            }),
            ..PipelineConfig::default()
        };
        let board = Arc::new(SeriesBoard::new());
        let orch = Orchestrator::open(
            config,
            sources,
            &[source_config(0, 2), source_config(1, 2)],
            Arc::new(ChunkFileSink),
            Arc::clone(&board) as Arc<dyn VisualizationSink>,
        )
        .unwrap();
        (orch, board)
    }

    fn route_until(orch: &mut Orchestrator, events: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while orch.acquisition().stats().polled_events < events && Instant::now() < deadline {
            if orch.route() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn recorded_files(dir: &Path) -> Vec<(u64, Vec<f64>)> {
        let mut files: Vec<(u64, Vec<f64>)> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "dgr"))
            .map(|p| {
                let stem = p.file_stem().unwrap().to_str().unwrap().to_string();
                let seq = stem.rsplit('_').next().unwrap().parse().unwrap();
                let ts = RecordReader::open(&p)
                    .unwrap()
                    .events()
                    .unwrap()
                    .iter()
                    .map(|e| e.timestamp_ns)
                    .collect();
                (seq, ts)
            })
            .collect();
        files.sort_by_key(|(seq, _)| *seq);
        files
    }

    #[test]
    fn test_every_acquired_event_reaches_both_consumers() {
        let dir = tempdir().unwrap();
        let (mut orch, board) = pipeline(dir.path(), true);
        orch.start().unwrap();
        route_until(&mut orch, 130);
        orch.route();
        let deadline = Instant::now() + Duration::from_secs(5);
        while orch.recording().unwrap().stats().files_written < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        let summary = orch.close();

        // The tail of module 1 arrives during the final drain.
        assert_eq!(summary.routed_events, 135);
        assert_eq!(summary.monitor.events, 135);
        let rec = summary.recording.unwrap();
        assert_eq!(rec.written_events, 135);
        assert!(rec.faults.is_empty());

        let files = recorded_files(dir.path());
        assert!(files.len() > 1);
        let total: usize = files.iter().map(|(_, ts)| ts.len()).sum();
        assert_eq!(total, 135);
        for (i, (seq, ts)) in files.iter().enumerate() {
            assert_eq!(*seq, i as u64);
            assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        }

        let hist = board.histogram("hist_00_00").unwrap();
        assert_eq!(hist.entries(), 50);
        assert!(board.trace("trace_01_01_ap1").is_some());
    }

    #[test]
    fn test_reload_continues_sequence_and_resets_histograms() {
        let dir = tempdir().unwrap();
        let (mut orch, _board) = pipeline(dir.path(), true);
        orch.start().unwrap();
        route_until(&mut orch, 130);

        orch.reload(&[source_config(0, 2), source_config(1, 2)]).unwrap();
        assert!(orch.is_running());
        let before = recorded_files(dir.path()).len() as u64;
        assert_eq!(orch.monitoring().histogram(0, 0).unwrap().entries(), 0);

        let summary = orch.stop();
        assert_eq!(summary.routed_events, 135);
        let files = recorded_files(dir.path());
        assert_eq!(files.len() as u64, before);
        for (i, (seq, _)) in files.iter().enumerate() {
            assert_eq!(*seq, i as u64);
        }
    }

    #[test]
    fn test_reload_with_new_topology_reconfigures_monitor() {
        let dir = tempdir().unwrap();
        let (mut orch, board) = pipeline(dir.path(), false);
        orch.start().unwrap();
        orch.reload(&[source_config(0, 4), source_config(1, 2)]).unwrap();
        assert!(board.series("hist_00_03").is_some());
        orch.stop();
    }

    #[test]
    fn test_monitor_only_pipeline() {
        let dir = tempdir().unwrap();
        let (mut orch, _board) = pipeline(dir.path(), false);
        orch.start().unwrap();
        route_until(&mut orch, 130);
        let summary = orch.stop();
        assert!(summary.recording.is_none());
        assert_eq!(summary.monitor.events, 135);
        assert!(recorded_files(dir.path()).is_empty());
    }

    #[test]
    fn test_mismatched_configs_are_fatal_at_open() {
        let dir = tempdir().unwrap();
        let sources: Vec<Box<dyn EventSource>> = vec![Box::new(ScriptedSource::new(0, 2))];
        let result = Orchestrator::open(
            PipelineConfig::default(),
            sources,
            &[],
            Arc::new(ChunkFileSink),
            Arc::new(SeriesBoard::new()),
        );
        assert!(matches!(result, Err(PipelineError::Source(_))));
        drop(dir);
    }

    #[cfg(feature = "simulator")]
    #[test]
    fn test_simulated_run_loses_nothing() {
        use crate::source::SimulatedDigitizer;

        let dir = tempdir().unwrap();
        let mut cfg = source_config(5, 4);
        cfg.url = "sim://bench".to_string();
        cfg.event_rate_hz = 20_000.0;
        cfg.record_length = 32;
        let config = PipelineConfig {
            recording: Some(RecordingConfig {
                file_prefix: dir.path().join("sim").to_string_lossy().into_owned(),
                max_file_bytes: 64 * 1024,
                ..RecordingConfig::default()
            }),
            ..PipelineConfig::default()
        };
        let mut orch = Orchestrator::open(
            config,
            vec![Box::new(SimulatedDigitizer::new())],
            &[cfg],
            Arc::new(ChunkFileSink),
            Arc::new(SeriesBoard::new()),
        )
        .unwrap();
        orch.start().unwrap();
        let until = Instant::now() + Duration::from_millis(200);
        while Instant::now() < until {
            if orch.route() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        let summary = orch.close();

        assert!(summary.routed_events > 0);
        assert_eq!(summary.routed_events, summary.acquisition.polled_events);
        let rec = summary.recording.unwrap();
        assert_eq!(rec.written_events, summary.routed_events);
        let files = recorded_files(dir.path());
        let total: u64 = files.iter().map(|(_, ts)| ts.len() as u64).sum();
        assert_eq!(total, summary.routed_events);
    }
}
