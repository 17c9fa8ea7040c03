//! digidaq-core - concurrent digitizer event pipeline.
//!
//! Provides:
//! - `source`: the `EventSource` contract, raw events, source configs
//!   (and the `SimulatedDigitizer` with the `simulator` feature, default)
//! - `acquisition`: `AcquisitionAggregator`: one poller thread per source,
//!   one shared buffer drained by buffer swap
//! - `recording`: `RecordingEngine`: converter/writer pools, size and age
//!   rotation with carry-over
//! - `monitor`: `MonitoringEngine`: per-channel histograms and traces,
//!   periodic publishing to a `VisualizationSink`
//! - `storage`: record file format and the `RecordSink` trait
//! - `orchestrator`: wiring of the three engines, reload, run summary
//! - `fmt`, `util`: shared helpers

pub mod acquisition;
pub mod fmt;
pub mod monitor;
pub mod orchestrator;
pub mod recording;
pub mod source;
pub mod storage;
pub mod util;
