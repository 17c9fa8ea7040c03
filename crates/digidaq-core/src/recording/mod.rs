//! Recording engine: converts, orders and persists event batches in rotated files.
//!
//! ```text
//!  submit(batch) ─► queue ─► converter pool ─► accumulator ─► writer pool ─► RecordSink
//!                    (mutex)   (convert+sort)     (mutex)      (rotate, split)
//! ```
//!
//! Converters turn each [`RawEvent`](crate::source::RawEvent) into a
//! [`PersistableEvent`], sort the batch and append it to the accumulator.
//! Writers check the rotation conditions under the accumulator lock, swap the
//! buffer out and do the global sort and the write outside of it. When a
//! size-triggered set exceeds the budget, only the earliest budget's worth is
//! written and the rest is carried over into the next file.
//!
//! `stop()` joins all workers and then drains synchronously, so every event
//! submitted before `stop()` ends up in a file (or in a reported write fault).

mod accumulator;

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

pub use accumulator::{RotationState, RotationTrigger};
use accumulator::{Accumulator, Extracted, RotationLimits, sort_by_timestamp, split_to_budget};

use crate::fmt::format_bytes;
use crate::source::{RawEvent, SharedBatch};
use crate::storage::{PersistableEvent, RecordSink};
use crate::util::lock;

/// Settings of one recording session.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Files are named `<prefix>_<sequence>.<extension>`.
    pub file_prefix: String,
    pub max_file_bytes: u64,
    pub max_file_age: Duration,
    pub converter_threads: usize,
    pub writer_threads: usize,
    /// Idle sleep of the workers.
    pub poll_interval: Duration,
    /// How long `stop()` lets the converters catch up before draining inline.
    pub grace_period: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            file_prefix: "run".to_string(),
            max_file_bytes: 100 * 1024 * 1024,
            max_file_age: Duration::from_secs(30 * 60),
            converter_threads: 4,
            writer_threads: 2,
            poll_interval: Duration::from_millis(1),
            grace_period: Duration::from_millis(10),
        }
    }
}

impl RecordingConfig {
    fn validate(&self) -> Result<(), RecordError> {
        if self.file_prefix.is_empty() {
            return Err(RecordError::InvalidConfig("empty file prefix".to_string()));
        }
        if self.max_file_bytes == 0 {
            return Err(RecordError::InvalidConfig(
                "max file size must be positive".to_string(),
            ));
        }
        if self.converter_threads == 0 || self.writer_threads == 0 {
            return Err(RecordError::InvalidConfig(
                "at least one converter and one writer thread required".to_string(),
            ));
        }
        Ok(())
    }

    fn limits(&self) -> RotationLimits {
        RotationLimits {
            max_file_bytes: self.max_file_bytes,
            max_file_age: self.max_file_age,
        }
    }
}

/// Error returned by the recording engine's control methods.
#[derive(Debug)]
pub enum RecordError {
    AlreadyRunning,
    NotConfigured,
    InvalidConfig(String),
    /// A worker thread could not be spawned.
    Spawn(io::Error),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::AlreadyRunning => write!(f, "recording is already running"),
            RecordError::NotConfigured => write!(f, "recording is not configured"),
            RecordError::InvalidConfig(msg) => write!(f, "invalid recording config: {}", msg),
            RecordError::Spawn(e) => write!(f, "failed to spawn recording worker: {}", e),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// A rotation whose file could not be written. Its events are lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFault {
    pub file: PathBuf,
    pub events: usize,
    pub cause: String,
}

/// Counters of the current recording session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStats {
    pub submitted_batches: u64,
    pub submitted_events: u64,
    pub converted_events: u64,
    pub written_events: u64,
    pub written_bytes: u64,
    pub files_written: u64,
    pub carried_over_events: u64,
    pub failed_writes: u64,
    /// Events lost to failed writes.
    pub dropped_events: u64,
    /// Events still queued or accumulated when the snapshot was taken.
    pub pending_events: u64,
    pub faults: Vec<WriteFault>,
}

/// Lock-free counters for the hot path.
#[derive(Debug, Default)]
struct AtomicStats {
    submitted_batches: AtomicU64,
    submitted_events: AtomicU64,
    converted_events: AtomicU64,
    written_events: AtomicU64,
    written_bytes: AtomicU64,
    files_written: AtomicU64,
    carried_over_events: AtomicU64,
    failed_writes: AtomicU64,
    dropped_events: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> RecordingStats {
        RecordingStats {
            submitted_batches: self.submitted_batches.load(Ordering::Relaxed),
            submitted_events: self.submitted_events.load(Ordering::Relaxed),
            converted_events: self.converted_events.load(Ordering::Relaxed),
            written_events: self.written_events.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            carried_over_events: self.carried_over_events.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            pending_events: 0,
            faults: Vec::new(),
        }
    }
}

/// State shared by the engine and its workers for one session.
struct Session {
    config: RecordingConfig,
    limits: RotationLimits,
    sink: Arc<dyn RecordSink>,
    queue: Mutex<VecDeque<SharedBatch>>,
    acc: Mutex<Accumulator>,
    running: AtomicBool,
    stats: AtomicStats,
    faults: Mutex<Vec<WriteFault>>,
}

impl Session {
    fn new(config: RecordingConfig, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            limits: config.limits(),
            config,
            sink,
            queue: Mutex::new(VecDeque::new()),
            acc: Mutex::new(Accumulator::new(Instant::now())),
            running: AtomicBool::new(false),
            stats: AtomicStats::default(),
            faults: Mutex::new(Vec::new()),
        }
    }

    fn file_name(&self, sequence: u64) -> PathBuf {
        PathBuf::from(format!(
            "{}_{}.{}",
            self.config.file_prefix,
            sequence,
            self.sink.extension()
        ))
    }

    fn accumulate(&self, batch: &[RawEvent]) {
        let (mut events, bytes) = convert_batch(batch);
        let n = events.len() as u64;
        lock(&self.acc).append(&mut events, bytes);
        self.stats.converted_events.fetch_add(n, Ordering::Relaxed);
    }

    /// Sorts the extracted set, applies the carry-over rule and writes the file.
    fn write_extracted(&self, extracted: Extracted) {
        let Extracted {
            mut events,
            bytes,
            sequence,
            trigger,
        } = extracted;
        if events.is_empty() {
            return;
        }
        sort_by_timestamp(&mut events);

        if trigger == RotationTrigger::Size && bytes > self.limits.max_file_bytes {
            let (carry, carry_bytes) = split_to_budget(&mut events, self.limits.max_file_bytes);
            if !carry.is_empty() {
                self.stats
                    .carried_over_events
                    .fetch_add(carry.len() as u64, Ordering::Relaxed);
                debug!(
                    sequence,
                    carried = carry.len(),
                    carried_bytes = carry_bytes,
                    "carrying events into next file"
                );
                lock(&self.acc).push_back(carry, carry_bytes);
            }
        }

        let file = self.file_name(sequence);
        let count = events.len();
        match self.sink.write(&file, &events) {
            Ok(size) => {
                self.stats.files_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .written_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.stats.written_bytes.fetch_add(size, Ordering::Relaxed);
                info!(
                    file = %file.display(),
                    events = count,
                    size = %format_bytes(size),
                    %trigger,
                    "record file written"
                );
            }
            Err(e) => {
                self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                error!(file = %file.display(), events = count, error = %e, "record file write failed");
                lock(&self.faults).push(WriteFault {
                    file,
                    events: count,
                    cause: e.to_string(),
                });
            }
        }
    }

    /// Converts everything still queued, merges it with the accumulator and
    /// writes one last file.
    fn final_drain(&self) {
        let batches: Vec<SharedBatch> = lock(&self.queue).drain(..).collect();
        for batch in &batches {
            self.accumulate(batch);
        }
        let extracted = {
            let mut acc = lock(&self.acc);
            if acc.is_empty() {
                return;
            }
            acc.extract(RotationTrigger::Drain, Instant::now())
        };
        self.write_extracted(extracted);
    }

    fn snapshot(&self) -> RecordingStats {
        let mut stats = self.stats.snapshot();
        let queued: usize = lock(&self.queue).iter().map(|b| b.len()).sum();
        stats.pending_events = queued as u64 + lock(&self.acc).len() as u64;
        stats.faults = lock(&self.faults).clone();
        stats
    }
}

/// Converts a batch and sorts it by timestamp. Returns the events and their
/// summed footprint.
pub fn convert_batch(batch: &[RawEvent]) -> (Vec<PersistableEvent>, u64) {
    let mut events: Vec<PersistableEvent> = batch.iter().map(PersistableEvent::from_raw).collect();
    let bytes = events.iter().map(PersistableEvent::footprint).sum();
    sort_by_timestamp(&mut events);
    (events, bytes)
}

fn converter_loop(session: Arc<Session>) {
    let interval = session.config.poll_interval;
    while session.running.load(Ordering::Acquire) {
        let batch = lock(&session.queue).pop_front();
        match batch {
            Some(batch) => session.accumulate(&batch),
            None => thread::sleep(interval),
        }
    }
}

fn writer_loop(session: Arc<Session>) {
    let interval = session.config.poll_interval;
    while session.running.load(Ordering::Acquire) {
        let extracted = {
            let now = Instant::now();
            let mut acc = lock(&session.acc);
            acc.due(&session.limits, now)
                .map(|trigger| acc.extract(trigger, now))
        };
        match extracted {
            Some(extracted) => session.write_extracted(extracted),
            None => thread::sleep(interval),
        }
    }
}

/// Owns the converter and writer pools of the current session.
pub struct RecordingEngine {
    sink: Arc<dyn RecordSink>,
    session: Option<Arc<Session>>,
    workers: Vec<JoinHandle<()>>,
    /// Events submitted before the first `configure`.
    unconfigured_drops: AtomicU64,
}

impl RecordingEngine {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink,
            session: None,
            workers: Vec::new(),
            unconfigured_drops: AtomicU64::new(0),
        }
    }

    /// Starts a new session: counters are cleared and the file sequence
    /// restarts at 0. Rejected while running.
    pub fn configure(&mut self, config: RecordingConfig) -> Result<(), RecordError> {
        if self.is_running() {
            return Err(RecordError::AlreadyRunning);
        }
        config.validate()?;
        info!(
            prefix = %config.file_prefix,
            max_size = %format_bytes(config.max_file_bytes),
            max_age_s = config.max_file_age.as_secs(),
            "recording configured"
        );
        self.session = Some(Arc::new(Session::new(config, Arc::clone(&self.sink))));
        Ok(())
    }

    /// Spawns the worker pools. The file sequence continues from the last stop.
    pub fn start(&mut self) -> Result<(), RecordError> {
        let session = self.session.clone().ok_or(RecordError::NotConfigured)?;
        if self.is_running() {
            return Err(RecordError::AlreadyRunning);
        }
        lock(&session.acc).touch(Instant::now());
        session.running.store(true, Ordering::Release);

        let pools = [
            ("rec-convert", session.config.converter_threads, converter_loop as fn(Arc<Session>)),
            ("rec-write", session.config.writer_threads, writer_loop as fn(Arc<Session>)),
        ];
        for (prefix, count, body) in pools {
            for i in 0..count {
                let s = Arc::clone(&session);
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", prefix, i))
                    .spawn(move || body(s));
                match spawned {
                    Ok(handle) => self.workers.push(handle),
                    Err(e) => {
                        error!(error = %e, "failed to spawn recording worker");
                        self.stop();
                        return Err(RecordError::Spawn(e));
                    }
                }
            }
        }
        debug!(workers = self.workers.len(), "recording started");
        Ok(())
    }

    /// Enqueues a batch. Never blocks on conversion or I/O.
    pub fn submit(&self, batch: SharedBatch) {
        let Some(session) = &self.session else {
            let before = self
                .unconfigured_drops
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            if before == 0 {
                warn!(events = batch.len(), "recording not configured, dropping batches");
            }
            return;
        };
        session
            .stats
            .submitted_batches
            .fetch_add(1, Ordering::Relaxed);
        session
            .stats
            .submitted_events
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        lock(&session.queue).push_back(batch);
    }

    /// Joins the workers and writes everything still pending.
    ///
    /// Returns the session counters including all write faults so far.
    pub fn stop(&mut self) -> RecordingStats {
        let Some(session) = self.session.clone() else {
            return RecordingStats::default();
        };

        if session.running.load(Ordering::Acquire) {
            let deadline = Instant::now() + session.config.grace_period;
            while Instant::now() < deadline && !lock(&session.queue).is_empty() {
                thread::sleep(session.config.poll_interval);
            }
            session.running.store(false, Ordering::Release);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("recording worker panicked");
            }
        }

        session.final_drain();
        let stats = session.snapshot();
        info!(
            files = stats.files_written,
            events = stats.written_events,
            size = %format_bytes(stats.written_bytes),
            faults = stats.faults.len(),
            "recording stopped"
        );
        stats
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    /// Events dropped because they arrived before `configure`.
    pub fn unconfigured_drops(&self) -> u64 {
        self.unconfigured_drops.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RecordingStats {
        self.session
            .as_ref()
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Rotation bookkeeping of the file being filled.
    pub fn rotation_state(&self) -> Option<RotationState> {
        self.session.as_ref().map(|s| lock(&s.acc).state())
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
