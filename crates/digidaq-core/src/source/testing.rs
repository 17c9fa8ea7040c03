//! Deterministic event source and event builders shared by unit tests.

use std::collections::VecDeque;

use super::{EventBatch, EventSource, Probe, RawEvent, SourceConfig, SourceError, Waveforms};

/// Builds an event whose four probes carry `waveform_len` samples.
pub(crate) fn event(module: u8, channel: u8, ts: f64, waveform_len: usize) -> RawEvent {
    let ev = RawEvent::new(module, channel, ts as u64, ts, 100 + channel as u16);
    if waveform_len == 0 {
        return ev;
    }
    let waveforms = Waveforms {
        analog1: Probe::new(0, (0..waveform_len as i32).collect()),
        analog2: Probe::new(1, vec![-1; waveform_len]),
        digital1: Probe::new(2, vec![1; waveform_len]),
        digital2: Probe::new(3, vec![0; waveform_len]),
    };
    ev.with_waveforms(waveforms).unwrap()
}

/// Source replaying a fixed script of poll results.
///
/// After the script runs out it returns empty batches. `tail` is handed out
/// by the first poll after `stop()`, like a board flushing its FIFO.
pub(crate) struct ScriptedSource {
    pub module: u8,
    pub channels: u32,
    pub script: VecDeque<Result<EventBatch, SourceError>>,
    pub tail: EventBatch,
    failed_starts: usize,
    running: bool,
}

impl ScriptedSource {
    pub fn new(module: u8, channels: u32) -> Self {
        Self {
            module,
            channels,
            script: VecDeque::new(),
            tail: Vec::new(),
            failed_starts: 0,
            running: false,
        }
    }

    pub fn push(mut self, batch: EventBatch) -> Self {
        self.script.push_back(Ok(batch));
        self
    }

    pub fn push_fault(mut self, msg: &str) -> Self {
        self.script
            .push_back(Err(SourceError::Device(msg.to_string())));
        self
    }

    pub fn with_tail(mut self, tail: EventBatch) -> Self {
        self.tail = tail;
        self
    }

    /// The next `n` calls to `start()` fail with a device error.
    pub fn with_failed_starts(mut self, n: usize) -> Self {
        self.failed_starts = n;
        self
    }

    fn invalid(&self, operation: &'static str) -> SourceError {
        SourceError::InvalidState {
            source: self.name(),
            operation,
            state: if self.running { "running" } else { "idle" },
        }
    }
}

impl EventSource for ScriptedSource {
    fn name(&self) -> String {
        format!("scripted://{}", self.module)
    }

    fn open(&mut self, _config: &SourceConfig) -> Result<(), SourceError> {
        Ok(())
    }

    fn configure(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        if self.running {
            return Err(self.invalid("configure"));
        }
        self.channels = config.channels;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SourceError> {
        if self.running {
            return Err(self.invalid("start"));
        }
        if self.failed_starts > 0 {
            self.failed_starts -= 1;
            return Err(SourceError::Device("start refused".to_string()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        if !self.running {
            return Err(self.invalid("stop"));
        }
        self.running = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn poll_events(&mut self) -> Result<EventBatch, SourceError> {
        if !self.running {
            return Ok(std::mem::take(&mut self.tail));
        }
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn module_id(&self) -> u8 {
        self.module
    }

    fn channel_count(&self) -> u32 {
        self.channels
    }

    fn sample_interval_ns(&self) -> u32 {
        4
    }
}
