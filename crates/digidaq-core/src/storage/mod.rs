//! Durable storage of recorded events.
//!
//! - [`event`]: the persisted event type and its size accounting
//! - [`chunk`]: the compressed record file format (writer, reader, metadata)
//! - [`sink`]: the [`RecordSink`] trait the recording engine writes through

pub mod chunk;
pub mod event;
pub mod sink;

pub use chunk::{FrameInfo, RecordMetadata, RecordReader, read_record_metadata, write_record};
pub use event::{PersistableEvent, footprint_of};
pub use sink::{ChunkFileSink, RecordSink};
