//! Durable sinks that receive one ordered event set per rotation.

use std::fs;
use std::io;
use std::path::Path;

use super::chunk::write_record;
use super::event::PersistableEvent;

/// Destination of rotated record files.
///
/// `write` receives events already sorted by timestamp and must publish the
/// file atomically: either the whole file appears under `file_name` or none.
pub trait RecordSink: Send + Sync {
    /// File extension without the dot.
    fn extension(&self) -> &str;

    /// Writes one file and returns its size in bytes.
    fn write(&self, file_name: &Path, events: &[PersistableEvent]) -> io::Result<u64>;
}

/// Writes the compressed record file format, see [`super::chunk`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkFileSink;

impl RecordSink for ChunkFileSink {
    fn extension(&self) -> &str {
        "dgr"
    }

    fn write(&self, file_name: &Path, events: &[PersistableEvent]) -> io::Result<u64> {
        if let Some(parent) = file_name.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        write_record(file_name, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chunk::RecordReader;
    use tempfile::tempdir;

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/42/data_0.dgr");
        let events = vec![PersistableEvent {
            module: 0,
            channel: 1,
            timestamp_ns: 5.0,
            energy_long: 10,
            energy_short: 0,
            waveform: Vec::new(),
        }];

        let bytes = ChunkFileSink.write(&path, &events).unwrap();
        assert_eq!(bytes, fs::metadata(&path).unwrap().len());
        assert_eq!(RecordReader::open(&path).unwrap().events().unwrap(), events);
    }
}
