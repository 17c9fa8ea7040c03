//! Acquisition aggregator: fans N event sources into one shared buffer.
//!
//! Each source sits in a fixed slot; while acquisition runs, the slot is
//! locked by its own poller thread.
//! Pollers stage events thread-locally and append them to the shared buffer
//! under a single mutex. Consumers drain the buffer with [`AcquisitionAggregator::take_all`],
//! which swaps the buffer out instead of copying it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::source::{ConfigError, EventBatch, EventSource, ModuleLayout, SourceConfig, SourceError};
use crate::util::lock;

/// Tunables of the aggregator.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Sleep between polls when a source returned nothing.
    pub poll_interval: Duration,
    /// Capacity reserved for the shared buffer after each swap.
    pub reserve_events: usize,
    /// Upper bound on polls used to drain a source after it was stopped.
    pub final_drain_polls: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            reserve_events: 16 * 1024,
            final_drain_polls: 64,
        }
    }
}

/// Counters since the aggregator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub polled_events: u64,
    pub faults: u64,
}

struct Shared {
    buffer: Mutex<EventBatch>,
    running: AtomicBool,
    polled_events: AtomicU64,
    faults: AtomicU64,
}

impl Shared {
    fn append(&self, staging: &mut EventBatch) {
        if staging.is_empty() {
            return;
        }
        let n = staging.len() as u64;
        lock(&self.buffer).append(staging);
        self.polled_events.fetch_add(n, Ordering::Relaxed);
    }

    fn fault(&self, source: &str, err: &SourceError) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        warn!(source, error = %err, "source fault");
    }
}

/// One source, locked by its poller while acquisition runs.
type SourceSlot = Arc<Mutex<Box<dyn EventSource>>>;

/// Owns the event sources and their poller threads.
pub struct AcquisitionAggregator {
    config: AcquisitionConfig,
    shared: Arc<Shared>,
    /// Slot `i` always holds the i-th configured source, running or not.
    sources: Vec<SourceSlot>,
    /// Running pollers with the index of the slot they hold.
    pollers: Vec<(usize, JoinHandle<()>)>,
    layouts: Vec<ModuleLayout>,
}

impl Default for AcquisitionAggregator {
    fn default() -> Self {
        Self::new(AcquisitionConfig::default())
    }
}

impl AcquisitionAggregator {
    pub fn new(config: AcquisitionConfig) -> Self {
        let buffer = Vec::with_capacity(config.reserve_events);
        Self {
            config,
            shared: Arc::new(Shared {
                buffer: Mutex::new(buffer),
                running: AtomicBool::new(false),
                polled_events: AtomicU64::new(0),
                faults: AtomicU64::new(0),
            }),
            sources: Vec::new(),
            pollers: Vec::new(),
            layouts: Vec::new(),
        }
    }

    /// Installs the sources to acquire from, replacing any previous set.
    pub fn configure(&mut self, sources: Vec<Box<dyn EventSource>>) -> Result<(), SourceError> {
        if self.is_running() {
            return Err(SourceError::InvalidState {
                source: "aggregator".to_string(),
                operation: "configure",
                state: "running",
            });
        }
        self.layouts = sources.iter().map(|s| s.layout()).collect();
        self.sources = sources.into_iter().map(|s| Arc::new(Mutex::new(s))).collect();
        Ok(())
    }

    /// Opens and configures every installed source with its config.
    ///
    /// `configs[i]` belongs to the i-th installed source. Any failure is a
    /// configuration fault and is returned immediately.
    pub fn open(&mut self, configs: &[SourceConfig]) -> Result<(), SourceError> {
        self.check_configs(configs)?;
        for (slot, config) in self.sources.iter().zip(configs) {
            let mut source = lock(slot);
            source.open(config)?;
            source.configure(config)?;
            info!(
                source = %source.name(),
                module = config.module_id,
                firmware = %config.firmware,
                channels = config.channels,
                "source opened"
            );
        }
        self.refresh_layouts();
        Ok(())
    }

    /// Re-applies configs to all idle sources in parallel.
    ///
    /// Every source is attempted; the first failure is returned.
    pub fn reconfigure(&mut self, configs: &[SourceConfig]) -> Result<(), SourceError> {
        if self.is_running() {
            return Err(SourceError::InvalidState {
                source: "aggregator".to_string(),
                operation: "reconfigure",
                state: "running",
            });
        }
        self.check_configs(configs)?;

        let results: Vec<Result<(), SourceError>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .sources
                .iter()
                .zip(configs)
                .map(|(slot, config)| scope.spawn(move || lock(slot).configure(config)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(SourceError::Device("configure thread panicked".to_string()))
                    })
                })
                .collect()
        });

        self.refresh_layouts();
        let mut first = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "reconfigure failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Starts every source and spawns one poller thread per source.
    ///
    /// A source that refuses to start is logged and counted; the others run.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.shared.running.store(true, Ordering::Release);

        for (idx, slot) in self.sources.iter().enumerate() {
            let (name, module) = {
                let mut source = lock(slot);
                let name = source.name();
                if let Err(e) = source.start() {
                    self.shared.fault(&name, &e);
                    continue;
                }
                (name, source.module_id())
            };
            let slot = Arc::clone(slot);
            let shared = Arc::clone(&self.shared);
            let interval = self.config.poll_interval;
            let drain_polls = self.config.final_drain_polls;
            let spawned = thread::Builder::new()
                .name(format!("poll-{}", module))
                .spawn(move || poll_loop(&slot, &shared, interval, drain_polls));
            match spawned {
                Ok(handle) => self.pollers.push((idx, handle)),
                Err(e) => {
                    error!(source = %name, error = %e, "failed to spawn poller");
                    if let Err(e) = lock(&self.sources[idx]).stop() {
                        self.shared.fault(&name, &e);
                    }
                }
            }
        }
        info!(pollers = self.pollers.len(), "acquisition started");
    }

    /// Stops all pollers. Each poller stops its source, drains it and releases
    /// its slot. Events already buffered stay available to [`take_all`](Self::take_all).
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        for (idx, handle) in std::mem::take(&mut self.pollers) {
            if handle.join().is_err() {
                let mut source = lock(&self.sources[idx]);
                let name = source.name();
                error!(source = %name, "poller thread panicked");
                if let Err(e) = source.stop() {
                    self.shared.fault(&name, &e);
                }
            }
        }
        info!(
            polled = self.shared.polled_events.load(Ordering::Relaxed),
            faults = self.shared.faults.load(Ordering::Relaxed),
            "acquisition stopped"
        );
    }

    /// Closes every idle source.
    pub fn close(&mut self) {
        self.stop();
        for slot in &self.sources {
            let mut source = lock(slot);
            if let Err(e) = source.close() {
                self.shared.fault(&source.name(), &e);
            }
        }
    }

    /// Takes everything buffered so far. Never blocks on the sources.
    pub fn take_all(&self) -> EventBatch {
        let mut buffer = lock(&self.shared.buffer);
        if buffer.is_empty() {
            return Vec::new();
        }
        std::mem::replace(&mut *buffer, Vec::with_capacity(self.config.reserve_events))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Channel layout of every configured source.
    pub fn topology(&self) -> Vec<ModuleLayout> {
        self.layouts.clone()
    }

    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            polled_events: self.shared.polled_events.load(Ordering::Relaxed),
            faults: self.shared.faults.load(Ordering::Relaxed),
        }
    }

    fn check_configs(&self, configs: &[SourceConfig]) -> Result<(), SourceError> {
        if configs.len() != self.sources.len() {
            return Err(ConfigError::Invalid(format!(
                "{} configs for {} sources",
                configs.len(),
                self.sources.len()
            ))
            .into());
        }
        Ok(())
    }

    fn refresh_layouts(&mut self) {
        self.layouts = self.sources.iter().map(|s| lock(s).layout()).collect();
    }
}

impl Drop for AcquisitionAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(slot: &Mutex<Box<dyn EventSource>>, shared: &Shared, interval: Duration, drain_polls: usize) {
    let mut source = lock(slot);
    let name = source.name();
    let mut staging: EventBatch = Vec::new();
    debug!(source = %name, "poller started");

    while shared.running.load(Ordering::Acquire) {
        match source.poll_events() {
            Ok(mut events) if !events.is_empty() => {
                staging.append(&mut events);
                shared.append(&mut staging);
            }
            Ok(_) => thread::sleep(interval),
            Err(e) => {
                shared.fault(&name, &e);
                thread::sleep(interval);
            }
        }
    }

    if let Err(e) = source.stop() {
        shared.fault(&name, &e);
    }
    for _ in 0..drain_polls {
        match source.poll_events() {
            Ok(events) if events.is_empty() => break,
            Ok(mut events) => staging.append(&mut events),
            Err(e) => {
                shared.fault(&name, &e);
                break;
            }
        }
    }
    shared.append(&mut staging);
    debug!(source = %name, "poller finished");
}
