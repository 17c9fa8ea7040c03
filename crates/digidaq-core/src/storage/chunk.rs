//! Record file format: zstd-compressed event frames with a trailing index.
//!
//! Events arrive sorted by timestamp and are cut into frames of at most
//! [`FRAME_EVENTS`] events. Each frame is compressed independently so a reader
//! can decode any frame without touching the others.
//!
//! File layout:
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ HEADER (48 bytes, uncompressed)                         │
//! │   magic: [u8; 4]              = b"DGR1"                 │
//! │   version: u16                = 1                       │
//! │   _reserved: u16                                        │
//! │   frame_count: u32                                      │
//! │   _reserved: u32                                        │
//! │   event_count: u64                                      │
//! │   first_timestamp_ns: f64                               │
//! │   last_timestamp_ns: f64                                │
//! │   index_offset: u64           (byte offset in file)     │
//! ├─────────────────────────────────────────────────────────┤
//! │ EVENT FRAMES                                            │
//! │   zstd(postcard(Vec<PersistableEvent>))                 │
//! │   ...                                                   │
//! ├─────────────────────────────────────────────────────────┤
//! │ INDEX TABLE (frame_count × 32 bytes, uncompressed)      │
//! │   Per frame:                                            │
//! │     offset: u64                                         │
//! │     compressed_len: u64                                 │
//! │     event_count: u32                                    │
//! │     crc32: u32            (of the compressed bytes)     │
//! │     first_timestamp_ns: f64                             │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::fs;
use std::io::{self, BufWriter, Read as _, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use super::event::PersistableEvent;

const MAGIC: [u8; 4] = *b"DGR1";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 48;
const INDEX_ENTRY_SIZE: usize = 32;
const ZSTD_LEVEL: i32 = 3;

/// Maximum number of events per compressed frame.
pub const FRAME_EVENTS: usize = 4096;

/// Index entry of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub offset: u64,
    pub compressed_len: u64,
    pub event_count: u32,
    pub crc32: u32,
    pub first_timestamp_ns: f64,
}

/// Header and index of a record file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMetadata {
    pub version: u16,
    pub event_count: u64,
    pub first_timestamp_ns: f64,
    pub last_timestamp_ns: f64,
    pub frames: Vec<FrameInfo>,
}

impl RecordMetadata {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[at..at + 2]);
    u16::from_le_bytes(a)
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(a)
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(a)
}

fn le_f64(b: &[u8], at: usize) -> f64 {
    f64::from_bits(le_u64(b, at))
}

/// Parses the header. Returns (metadata without frames, frame_count, index_offset).
fn parse_header(header: &[u8]) -> io::Result<(RecordMetadata, usize, u64)> {
    if header.len() < HEADER_SIZE {
        return Err(io::Error::other("file too small for header"));
    }
    let magic = &header[0..4];
    if magic != MAGIC {
        return Err(io::Error::other(format!(
            "invalid magic: expected DGR1, got {:?}",
            magic
        )));
    }
    let version = le_u16(header, 4);
    if version != VERSION {
        return Err(io::Error::other(format!(
            "unsupported version: {}",
            version
        )));
    }
    let frame_count = le_u32(header, 8) as usize;
    let meta = RecordMetadata {
        version,
        event_count: le_u64(header, 16),
        first_timestamp_ns: le_f64(header, 24),
        last_timestamp_ns: le_f64(header, 32),
        frames: Vec::new(),
    };
    Ok((meta, frame_count, le_u64(header, 40)))
}

fn parse_index(index: &[u8], frame_count: usize) -> Vec<FrameInfo> {
    (0..frame_count)
        .map(|i| {
            let base = i * INDEX_ENTRY_SIZE;
            FrameInfo {
                offset: le_u64(index, base),
                compressed_len: le_u64(index, base + 8),
                event_count: le_u32(index, base + 16),
                crc32: le_u32(index, base + 20),
                first_timestamp_ns: le_f64(index, base + 24),
            }
        })
        .collect()
}

/// Reads only the header and index table of a record file.
///
/// Cheap compared to [`RecordReader::open`], which loads the whole file.
pub fn read_record_metadata(path: &Path) -> io::Result<RecordMetadata> {
    let mut file = fs::File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    let (mut meta, frame_count, index_offset) = parse_header(&header)?;

    let index_size = (frame_count * INDEX_ENTRY_SIZE) as u64;
    if index_offset.saturating_add(index_size) > file_len {
        return Err(io::Error::other("index extends past end of file"));
    }
    file.seek(SeekFrom::Start(index_offset))?;
    let mut index = vec![0u8; index_size as usize];
    file.read_exact(&mut index)?;

    meta.frames = parse_index(&index, frame_count);
    Ok(meta)
}

/// Reader with per-frame random access.
pub struct RecordReader {
    metadata: RecordMetadata,
    data: Vec<u8>,
}

impl RecordReader {
    /// Loads a record file and validates its header and index.
    pub fn open(path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        let (mut metadata, frame_count, index_offset) = parse_header(&data)?;

        let index_start = index_offset as usize;
        let index_end = index_start.saturating_add(frame_count * INDEX_ENTRY_SIZE);
        if index_start < HEADER_SIZE || index_end > data.len() {
            return Err(io::Error::other("index extends past end of file"));
        }
        metadata.frames = parse_index(&data[index_start..index_end], frame_count);

        for (i, frame) in metadata.frames.iter().enumerate() {
            let end = frame.offset.saturating_add(frame.compressed_len);
            if end > index_offset {
                return Err(io::Error::other(format!(
                    "frame {} extends into the index",
                    i
                )));
            }
        }

        Ok(Self { metadata, data })
    }

    pub fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    pub fn frame_count(&self) -> usize {
        self.metadata.frames.len()
    }

    /// Decodes a single frame, verifying its checksum.
    pub fn read_frame(&self, idx: usize) -> io::Result<Vec<PersistableEvent>> {
        let frame = self.metadata.frames.get(idx).ok_or_else(|| {
            io::Error::other(format!(
                "frame index {} out of range (count={})",
                idx,
                self.frame_count()
            ))
        })?;
        let start = frame.offset as usize;
        let end = start + frame.compressed_len as usize;
        let compressed = &self.data[start..end];

        let crc = crc32fast::hash(compressed);
        if crc != frame.crc32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame {} checksum mismatch: stored {:08x}, computed {:08x}",
                    idx, frame.crc32, crc
                ),
            ));
        }

        let raw = zstd::decode_all(compressed)?;
        let events: Vec<PersistableEvent> = postcard::from_bytes(&raw).map_err(|e| {
            warn!(
                idx,
                compressed_len = frame.compressed_len,
                raw_len = raw.len(),
                error = %e,
                "record: frame deserialization failed"
            );
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;
        if events.len() != frame.event_count as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame {} holds {} events, index says {}",
                    idx,
                    events.len(),
                    frame.event_count
                ),
            ));
        }
        Ok(events)
    }

    /// Decodes every frame in file order.
    pub fn events(&self) -> io::Result<Vec<PersistableEvent>> {
        let mut all = Vec::new();
        for idx in 0..self.frame_count() {
            all.extend(self.read_frame(idx)?);
        }
        Ok(all)
    }
}

/// Writes `events` as a record file and returns the file size.
///
/// The file is written atomically via a `.tmp` intermediate file, which is
/// removed again if any step fails.
pub fn write_record(path: &Path, events: &[PersistableEvent]) -> io::Result<u64> {
    if events.is_empty() {
        return Err(io::Error::other("cannot write empty record file"));
    }
    let frame_count = events.len().div_ceil(FRAME_EVENTS);
    if frame_count > u32::MAX as usize {
        return Err(io::Error::other("too many frames for record format"));
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let result = write_frames(tmp_path, events, frame_count).and_then(|size| {
        fs::rename(tmp_path, path)?;
        Ok(size)
    });
    if result.is_err() {
        let _ = fs::remove_file(tmp_path);
    }
    result
}

fn write_frames(tmp_path: &Path, events: &[PersistableEvent], frame_count: usize) -> io::Result<u64> {
    let file = fs::File::create(tmp_path)?;
    let mut out = BufWriter::new(file);
    out.write_all(&[0u8; HEADER_SIZE])?;

    let mut offset = HEADER_SIZE as u64;
    let mut index: Vec<FrameInfo> = Vec::with_capacity(frame_count);
    for frame in events.chunks(FRAME_EVENTS) {
        let raw = postcard::to_allocvec(&frame).map_err(io::Error::other)?;
        let compressed = zstd::bulk::compress(&raw, ZSTD_LEVEL)?;
        out.write_all(&compressed)?;
        index.push(FrameInfo {
            offset,
            compressed_len: compressed.len() as u64,
            event_count: frame.len() as u32,
            crc32: crc32fast::hash(&compressed),
            first_timestamp_ns: frame[0].timestamp_ns,
        });
        offset += compressed.len() as u64;
    }

    let index_offset = offset;
    for entry in &index {
        out.write_all(&entry.offset.to_le_bytes())?;
        out.write_all(&entry.compressed_len.to_le_bytes())?;
        out.write_all(&entry.event_count.to_le_bytes())?;
        out.write_all(&entry.crc32.to_le_bytes())?;
        out.write_all(&entry.first_timestamp_ns.to_le_bytes())?;
    }

    let first_ts = events[0].timestamp_ns;
    let last_ts = events[events.len() - 1].timestamp_ns;
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(frame_count as u32).to_le_bytes());
    header[16..24].copy_from_slice(&(events.len() as u64).to_le_bytes());
    header[24..32].copy_from_slice(&first_ts.to_le_bytes());
    header[32..40].copy_from_slice(&last_ts.to_le_bytes());
    header[40..48].copy_from_slice(&index_offset.to_le_bytes());

    let mut file = out.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_all()?;
    let size = index_offset + (index.len() * INDEX_ENTRY_SIZE) as u64;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn events(count: usize, waveform: usize) -> Vec<PersistableEvent> {
        (0..count)
            .map(|i| PersistableEvent {
                module: (i % 3) as u8,
                channel: (i % 16) as u8,
                timestamp_ns: 100.0 + i as f64 * 2.5,
                energy_long: (i % 4000) as u16,
                energy_short: -((i % 100) as i16),
                waveform: (0..waveform as i32).collect(),
            })
            .collect()
    }

    #[test]
    fn test_write_and_read_single_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_0.dgr");
        let written = events(10, 8);

        let size = write_record(&path, &written).unwrap();
        assert_eq!(size, fs::metadata(&path).unwrap().len());

        let reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), 1);
        assert_eq!(reader.metadata().event_count, 10);
        assert_eq!(reader.metadata().first_timestamp_ns, 100.0);
        assert_eq!(reader.metadata().last_timestamp_ns, 122.5);
        assert_eq!(reader.events().unwrap(), written);
    }

    #[test]
    fn test_multiple_frames_random_access() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_1.dgr");
        let written = events(FRAME_EVENTS * 2 + 17, 0);
        write_record(&path, &written).unwrap();

        let reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), 3);

        let last = reader.read_frame(2).unwrap();
        assert_eq!(last.len(), 17);
        assert_eq!(last[0], written[FRAME_EVENTS * 2]);
        let first = reader.read_frame(0).unwrap();
        assert_eq!(first.len(), FRAME_EVENTS);
        assert!(reader.read_frame(3).is_err());
    }

    #[test]
    fn test_metadata_matches_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_2.dgr");
        write_record(&path, &events(FRAME_EVENTS + 1, 4)).unwrap();

        let meta = read_record_metadata(&path).unwrap();
        let reader = RecordReader::open(&path).unwrap();
        assert_eq!(&meta, reader.metadata());
        assert_eq!(meta.frames[1].event_count, 1);
        assert_eq!(meta.frames[1].first_timestamp_ns, 100.0 + FRAME_EVENTS as f64 * 2.5);
    }

    #[test]
    fn test_corrupted_frame_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_3.dgr");
        write_record(&path, &events(100, 16)).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[HEADER_SIZE + 5] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let reader = RecordReader::open(&path).unwrap();
        let err = reader.read_frame(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.dgr");
        fs::write(&path, [7u8; 64]).unwrap();
        assert!(RecordReader::open(&path).is_err());
        assert!(read_record_metadata(&path).is_err());
    }

    #[test]
    fn test_empty_events_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.dgr");
        assert!(write_record(&path, &[]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run_4.dgr");
        write_record(&path, &events(3, 0)).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("run_4.dgr")]);
    }

    #[test]
    fn test_failed_write_removes_tmp_file() {
        let dir = tempdir().unwrap();
        // A non-empty directory in the target's place makes the final rename fail.
        let path = dir.path().join("run_5.dgr");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        assert!(write_record(&path, &events(3, 0)).is_err());
        assert!(!dir.path().join("run_5.dgr.tmp").exists());
        assert!(path.is_dir());
    }
}
