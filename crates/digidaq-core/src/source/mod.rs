//! Event sources: the boundary to acquisition hardware.
//!
//! The core never talks to a device directly. Everything it needs from a
//! digitizer is expressed by the [`EventSource`] trait:
//!
//! ```text
//!  open(config) ─► configure(config) ─► start() ─► poll_events()* ─► stop() ─► close()
//!                        ▲                                              │
//!                        └──────────────── reload ──────────────────────┘
//! ```
//!
//! [`SimulatedDigitizer`] implements the trait in software for benches and
//! tests (feature `simulator`).

mod config;
mod event;
#[cfg(feature = "simulator")]
mod simulated;
#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, Firmware, SourceConfig, load_config_list, load_source_configs};
pub use event::{EventBatch, Probe, RawEvent, SharedBatch, Waveforms};
#[cfg(feature = "simulator")]
pub use simulated::SimulatedDigitizer;

/// Fault reported by an event source.
///
/// Source faults are never fatal to the pipeline: the poller logs them and
/// keeps polling.
#[derive(Debug)]
pub enum SourceError {
    /// Operation called in the wrong lifecycle state.
    InvalidState {
        source: String,
        operation: &'static str,
        state: &'static str,
    },
    /// Device or transport failure.
    Device(String),
    /// The device returned data that violates the event invariants.
    Malformed(String),
    /// The configuration was rejected by the device.
    Config(ConfigError),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::InvalidState {
                source,
                operation,
                state,
            } => write!(f, "{}: cannot {} while {}", source, operation, state),
            SourceError::Device(msg) => write!(f, "device error: {}", msg),
            SourceError::Malformed(msg) => write!(f, "malformed event data: {}", msg),
            SourceError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<ConfigError> for SourceError {
    fn from(e: ConfigError) -> Self {
        SourceError::Config(e)
    }
}

/// Channel layout of one module, as needed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLayout {
    pub module: u8,
    pub channels: u32,
    /// Nanoseconds per waveform sample.
    pub sample_interval_ns: u32,
}

/// A hardware acquisition source (one physical digitizer).
///
/// Implementations are moved into a dedicated poller thread while running,
/// hence `Send`. `poll_events` must not block for longer than a device
/// read timeout; returning an empty batch is the normal idle answer.
pub trait EventSource: Send {
    /// Human-readable identity for logs (usually the device URL).
    fn name(&self) -> String;

    fn open(&mut self, config: &SourceConfig) -> Result<(), SourceError>;

    /// Applies (or re-applies) settings. Only valid while not acquiring.
    fn configure(&mut self, config: &SourceConfig) -> Result<(), SourceError>;

    fn start(&mut self) -> Result<(), SourceError>;

    fn stop(&mut self) -> Result<(), SourceError>;

    fn close(&mut self) -> Result<(), SourceError>;

    /// Returns every event read since the previous call. Never blocks for long.
    fn poll_events(&mut self) -> Result<EventBatch, SourceError>;

    fn module_id(&self) -> u8;

    fn channel_count(&self) -> u32;

    fn sample_interval_ns(&self) -> u32;

    fn layout(&self) -> ModuleLayout {
        ModuleLayout {
            module: self.module_id(),
            channels: self.channel_count(),
            sample_interval_ns: self.sample_interval_ns(),
        }
    }
}
