//! Software digitizer producing synthetic events.
//!
//! Mimics the readout of a real board closely enough to exercise the whole
//! pipeline: strictly increasing per-board timestamps, firmware-specific
//! energy fields, zero-energy suppression, and optional probe traces.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{EventBatch, EventSource, Firmware, Probe, RawEvent, SourceConfig, SourceError, Waveforms};

/// Upper bound on events returned by one poll. Excess is treated as dead time.
const MAX_EVENTS_PER_POLL: usize = 10_000;

/// ADC baseline of the synthetic traces.
const BASELINE: i32 = 8000;

/// Pile-up flag bit set on a small fraction of simulated hits.
pub const FLAG_PILEUP: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Opened,
    Configured,
    Running,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Opened => "open",
            State::Configured => "configured",
            State::Running => "running",
        }
    }
}

/// Simulated digitizer implementing [`EventSource`].
pub struct SimulatedDigitizer {
    state: State,
    config: Option<SourceConfig>,
    rng: StdRng,
    /// Device clock in ns, advanced with wall time while running.
    clock_ns: f64,
    last_poll: Option<Instant>,
    /// Fractional event count carried to the next poll.
    pending: f64,
    /// Events read out during `stop()`, returned by the next poll.
    tail: EventBatch,
}

impl Default for SimulatedDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDigitizer {
    pub fn new() -> Self {
        Self {
            state: State::Closed,
            config: None,
            rng: StdRng::seed_from_u64(0),
            clock_ns: 0.0,
            last_poll: None,
            pending: 0.0,
            tail: Vec::new(),
        }
    }

    fn invalid(&self, operation: &'static str) -> SourceError {
        SourceError::InvalidState {
            source: self.name(),
            operation,
            state: self.state.as_str(),
        }
    }

    fn config(&self) -> Result<&SourceConfig, SourceError> {
        self.config.as_ref().ok_or_else(|| self.invalid("read config"))
    }

    /// Produces the events a real board would have read out during `elapsed`.
    ///
    /// `poll_events` calls this with wall-clock time; tests call it directly
    /// for deterministic output.
    pub fn advance(&mut self, elapsed: Duration) -> Result<EventBatch, SourceError> {
        if self.state != State::Running {
            return Err(self.invalid("advance"));
        }
        let config = self.config()?.clone();
        let elapsed_ns = elapsed.as_nanos() as f64;

        let expected = config.event_rate_hz * elapsed.as_secs_f64() + self.pending;
        let per_trigger = match config.firmware {
            Firmware::Scope => config.channels as usize,
            _ => 1,
        };
        let mut triggers = expected.floor() as usize;
        self.pending = expected - triggers as f64;
        if triggers * per_trigger > MAX_EVENTS_PER_POLL {
            triggers = MAX_EVENTS_PER_POLL / per_trigger;
            self.pending = 0.0;
        }

        let mut batch = Vec::with_capacity(triggers * per_trigger);
        if triggers > 0 {
            let slot = elapsed_ns / triggers as f64;
            for i in 0..triggers {
                let ts = self.clock_ns + slot * (i as f64 + self.rng.r#gen::<f64>());
                self.emit_trigger(&config, ts, &mut batch)?;
            }
        }
        self.clock_ns += elapsed_ns;
        Ok(batch)
    }

    fn emit_trigger(
        &mut self,
        config: &SourceConfig,
        ts: f64,
        batch: &mut EventBatch,
    ) -> Result<(), SourceError> {
        let module = config.module();
        let coarse = ts as u64 / config.sample_interval_ns().max(1) as u64;

        match config.firmware {
            Firmware::Scope => {
                let record = config.record_length.max(1) as usize;
                for channel in 0..config.channels.min(256) {
                    let waveforms = self.scope_trace(record);
                    let event = RawEvent::new(module, channel as u8, coarse, ts, 0)
                        .with_waveforms(waveforms)?;
                    batch.push(event);
                }
            }
            Firmware::Psd | Firmware::Pha => {
                let channel = self.rng.gen_range(0..config.channels.min(256)) as u8;
                let energy = self.sample_energy();
                // The readout discards hits without a valid integral.
                if energy == 0 {
                    return Ok(());
                }
                let mut event = RawEvent::new(module, channel, coarse, ts, energy);
                if config.firmware == Firmware::Psd {
                    let ratio = self.rng.gen_range(0.6..0.95);
                    let short = (energy as f64 * ratio).min(i16::MAX as f64) as i16;
                    event = event.with_energy_short(short);
                }
                if self.rng.gen_bool(0.01) {
                    event = event.with_flags(FLAG_PILEUP);
                }
                if config.waveforms {
                    let waveforms = self.pulse_trace(config.record_length as usize, energy);
                    event = event.with_waveforms(waveforms)?;
                }
                batch.push(event);
            }
        }
        Ok(())
    }

    /// A photopeak on top of a flat continuum.
    fn sample_energy(&mut self) -> u16 {
        if self.rng.gen_bool(0.3) {
            return self.rng.gen_range(0..16_000);
        }
        let spread: f64 = (0..4).map(|_| self.rng.gen_range(-1.0..1.0)).sum();
        (6620.0 + spread * 150.0).clamp(0.0, u16::MAX as f64) as u16
    }

    fn pulse_trace(&mut self, len: usize, energy: u16) -> Waveforms {
        let t0 = len / 8;
        let gate = (len / 4).max(1);
        let amplitude = energy as f64 / 4.0;
        let tau = (len as f64 / 10.0).max(1.0);

        let analog1: Vec<i32> = (0..len)
            .map(|i| {
                let noise = self.rng.gen_range(-3..=3);
                let signal = if i >= t0 {
                    amplitude * (-((i - t0) as f64) / tau).exp()
                } else {
                    0.0
                };
                BASELINE - signal as i32 + noise
            })
            .collect();
        let delay = 4;
        let analog2: Vec<i32> = (0..len)
            .map(|i| {
                let prev = if i >= delay { analog1[i - delay] } else { BASELINE };
                analog1[i] - prev
            })
            .collect();
        let digital1 = (0..len).map(|i| u8::from(i >= t0 && i < t0 + gate)).collect();
        let digital2 = (0..len).map(|i| u8::from(i == t0)).collect();

        Waveforms {
            analog1: Probe::new(0, analog1),
            analog2: Probe::new(1, analog2),
            digital1: Probe::new(2, digital1),
            digital2: Probe::new(3, digital2),
        }
    }

    fn scope_trace(&mut self, len: usize) -> Waveforms {
        let analog1 = (0..len)
            .map(|_| BASELINE + self.rng.gen_range(-5..=5))
            .collect();
        Waveforms {
            analog1: Probe::new(0, analog1),
            analog2: Probe::new(1, vec![0; len]),
            digital1: Probe::new(2, vec![0; len]),
            digital2: Probe::new(3, vec![0; len]),
        }
    }
}

impl EventSource for SimulatedDigitizer {
    fn name(&self) -> String {
        self.config
            .as_ref()
            .map(|c| c.url.clone())
            .unwrap_or_else(|| "sim://unconfigured".to_string())
    }

    fn open(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        if self.state != State::Closed {
            return Err(self.invalid("open"));
        }
        config.validate()?;
        let seed = config.seed.unwrap_or(config.module_id as u64);
        self.rng = StdRng::seed_from_u64(seed);
        self.config = Some(config.clone());
        self.state = State::Opened;
        debug!(source = %config.url, firmware = %config.firmware, "simulated digitizer opened");
        Ok(())
    }

    fn configure(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        match self.state {
            State::Opened | State::Configured => {
                config.validate()?;
                self.config = Some(config.clone());
                self.state = State::Configured;
                Ok(())
            }
            _ => Err(self.invalid("configure")),
        }
    }

    fn start(&mut self) -> Result<(), SourceError> {
        if self.state != State::Configured {
            return Err(self.invalid("start"));
        }
        self.state = State::Running;
        self.pending = 0.0;
        self.last_poll = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SourceError> {
        if self.state != State::Running {
            return Err(self.invalid("stop"));
        }
        // Read out what accumulated since the last poll before disarming.
        if let Some(last) = self.last_poll.take() {
            let mut tail = self.advance(last.elapsed())?;
            self.tail.append(&mut tail);
        }
        self.state = State::Configured;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        match self.state {
            State::Opened | State::Configured => {
                self.tail.clear();
                self.state = State::Closed;
                Ok(())
            }
            _ => Err(self.invalid("close")),
        }
    }

    fn poll_events(&mut self) -> Result<EventBatch, SourceError> {
        match self.state {
            State::Running => {
                let now = Instant::now();
                let elapsed = self
                    .last_poll
                    .map(|last| now.duration_since(last))
                    .unwrap_or_default();
                self.last_poll = Some(now);
                self.advance(elapsed)
            }
            State::Opened | State::Configured => Ok(std::mem::take(&mut self.tail)),
            State::Closed => Err(self.invalid("poll")),
        }
    }

    fn module_id(&self) -> u8 {
        self.config.as_ref().map_or(0, SourceConfig::module)
    }

    fn channel_count(&self) -> u32 {
        self.config.as_ref().map_or(0, |c| c.channels)
    }

    fn sample_interval_ns(&self) -> u32 {
        self.config.as_ref().map_or(0, SourceConfig::sample_interval_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(firmware: Firmware, waveforms: bool) -> SourceConfig {
        SourceConfig {
            url: "sim://test".to_string(),
            firmware,
            module_id: 2,
            serial_number: None,
            channels: 4,
            sample_rate_msps: 250,
            record_length: 64,
            waveforms,
            event_rate_hz: 10_000.0,
            seed: Some(7),
            parameters: serde_json::Value::Null,
        }
    }

    fn running(firmware: Firmware, waveforms: bool) -> SimulatedDigitizer {
        let cfg = config(firmware, waveforms);
        let mut dig = SimulatedDigitizer::new();
        dig.open(&cfg).unwrap();
        dig.configure(&cfg).unwrap();
        dig.start().unwrap();
        dig
    }

    #[test]
    fn test_lifecycle_order_enforced() {
        let cfg = config(Firmware::Psd, false);
        let mut dig = SimulatedDigitizer::new();
        assert!(dig.start().is_err());
        assert!(dig.poll_events().is_err());
        dig.open(&cfg).unwrap();
        assert!(dig.start().is_err());
        dig.configure(&cfg).unwrap();
        dig.start().unwrap();
        assert!(dig.configure(&cfg).is_err());
        assert!(dig.close().is_err());
        dig.stop().unwrap();
        dig.close().unwrap();
    }

    #[test]
    fn test_psd_events_are_ordered_and_nonzero() {
        let mut dig = running(Firmware::Psd, false);
        let a = dig.advance(Duration::from_millis(50)).unwrap();
        let b = dig.advance(Duration::from_millis(50)).unwrap();
        assert!(!a.is_empty());

        let all: Vec<_> = a.iter().chain(b.iter()).collect();
        for pair in all.windows(2) {
            assert!(pair[0].fine_timestamp_ns <= pair[1].fine_timestamp_ns);
        }
        for ev in &all {
            assert_eq!(ev.module, 2);
            assert!(ev.channel < 4);
            assert!(ev.energy_long > 0);
            assert_eq!(ev.waveform_size(), 0);
        }
    }

    #[test]
    fn test_pha_has_no_short_gate() {
        let mut dig = running(Firmware::Pha, false);
        let batch = dig.advance(Duration::from_millis(20)).unwrap();
        assert!(batch.iter().all(|ev| ev.energy_short == 0));
    }

    #[test]
    fn test_waveforms_follow_record_length() {
        let mut dig = running(Firmware::Psd, true);
        let batch = dig.advance(Duration::from_millis(5)).unwrap();
        assert!(!batch.is_empty());
        for ev in &batch {
            assert_eq!(ev.waveform_size(), 64);
            let w = ev.waveforms().unwrap();
            assert_eq!(w.digital2.samples.iter().filter(|&&s| s == 1).count(), 1);
        }
    }

    #[test]
    fn test_scope_emits_one_event_per_channel() {
        let mut dig = running(Firmware::Scope, false);
        let batch = dig.advance(Duration::from_millis(1)).unwrap();
        assert_eq!(batch.len() % 4, 0);
        for trigger in batch.chunks(4) {
            let ts = trigger[0].fine_timestamp_ns;
            assert!(trigger.iter().all(|ev| ev.fine_timestamp_ns == ts));
            assert!(trigger.iter().all(|ev| ev.waveform_size() == 64));
        }
    }

    #[test]
    fn test_poll_is_capped() {
        let mut dig = running(Firmware::Pha, false);
        let batch = dig.advance(Duration::from_secs(10)).unwrap();
        assert!(batch.len() <= MAX_EVENTS_PER_POLL);
    }

    #[test]
    fn test_stop_keeps_tail_for_final_poll() {
        let mut dig = running(Firmware::Pha, false);
        std::thread::sleep(Duration::from_millis(20));
        dig.stop().unwrap();
        let tail = dig.poll_events().unwrap();
        assert!(!tail.is_empty());
        assert!(dig.poll_events().unwrap().is_empty());
    }
}
