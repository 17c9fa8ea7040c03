use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use clap::Parser;
use serde::Serialize;

use digidaq_core::fmt::{format_bytes, format_timestamp_ns};
use digidaq_core::storage::{PersistableEvent, RecordMetadata, RecordReader, read_record_metadata};

const RECORD_EXT: &str = "dgr";
const HEADER_SIZE: u64 = 48;
const INDEX_ENTRY_SIZE: u64 = 32;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "digidaq-dump", about = "Inspect digidaq record files")]
struct Cli {
    /// Path to a .dgr record file or a directory of them
    path: Option<PathBuf>,

    /// Decode every frame: verify checksums, show per-channel counts
    #[arg(long)]
    events: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let path = cli.path.clone().unwrap_or_else(|| PathBuf::from("."));

    if path.is_dir() {
        dump_directory(&path, &cli);
    } else if has_ext(&path, RECORD_EXT) {
        dump_record(&path, &cli);
    } else {
        eprintln!("Unknown file type: {}", path.display());
        std::process::exit(1);
    }
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().and_then(OsStr::to_str) == Some(ext)
}

/// Sequence number of a record file named `<prefix>_<n>.dgr`.
fn sequence_of(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (_, seq) = stem.rsplit_once('_')?;
    seq.parse().ok()
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap_or_default().to_string_lossy().into()
}

fn fmt_mtime(path: &Path) -> Option<String> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(
        DateTime::<Local>::from(modified)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    )
}

fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => {
            eprintln!("Error encoding JSON: {e}");
            std::process::exit(1);
        }
    }
}

// ── Event statistics ─────────────────────────────────────────────────────────

/// Per-(module, channel) summary of decoded events.
#[derive(Default, Clone, Copy)]
struct ChannelSummary {
    events: u64,
    with_waveform: u64,
    energy_sum: u64,
}

#[derive(Default)]
struct EventSummary {
    channels: BTreeMap<(u8, u8), ChannelSummary>,
    /// Events whose timestamp is lower than the previous event's.
    out_of_order: u64,
    last_timestamp_ns: Option<f64>,
}

impl EventSummary {
    fn add(&mut self, events: &[PersistableEvent]) {
        for ev in events {
            if let Some(last) = self.last_timestamp_ns
                && ev.timestamp_ns < last
            {
                self.out_of_order += 1;
            }
            self.last_timestamp_ns = Some(ev.timestamp_ns);

            let ch = self.channels.entry((ev.module, ev.channel)).or_default();
            ch.events += 1;
            ch.energy_sum += ev.energy_long as u64;
            if !ev.waveform.is_empty() {
                ch.with_waveform += 1;
            }
        }
    }

    fn total(&self) -> u64 {
        self.channels.values().map(|c| c.events).sum()
    }
}

/// Decodes all frames of a record. Frames that fail to decode are reported
/// by index and skipped.
fn summarize_events(path: &Path) -> io::Result<(EventSummary, Vec<String>)> {
    let reader = RecordReader::open(path)?;
    let mut summary = EventSummary::default();
    let mut bad_frames = Vec::new();
    for idx in 0..reader.frame_count() {
        match reader.read_frame(idx) {
            Ok(events) => summary.add(&events),
            Err(e) => bad_frames.push(format!("frame {idx}: {e}")),
        }
    }
    Ok((summary, bad_frames))
}

// ── JSON output types ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RecordJson {
    file: String,
    file_size: u64,
    format: String,
    sequence: Option<u64>,
    event_count: u64,
    frame_count: usize,
    sections: SectionsJson,
    time_range: Option<TimeRangeJson>,
    compressed_frame: StatsJson,
    #[serde(skip_serializing_if = "Option::is_none")]
    channels: Option<Vec<ChannelJson>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    out_of_order: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bad_frames: Vec<String>,
}

#[derive(Serialize)]
struct SectionsJson {
    header: u64,
    frames: u64,
    index: u64,
}

#[derive(Serialize)]
struct TimeRangeJson {
    first_ns: f64,
    last_ns: f64,
}

#[derive(Serialize)]
struct StatsJson {
    avg: u64,
    min: u64,
    max: u64,
}

#[derive(Serialize)]
struct ChannelJson {
    module: u8,
    channel: u8,
    events: u64,
    with_waveform: u64,
    mean_energy: f64,
}

#[derive(Serialize)]
struct DirectoryJson {
    path: String,
    files: usize,
    unreadable: Vec<String>,
    total_size: u64,
    event_count: u64,
    time_range: Option<TimeRangeJson>,
    sequence_gaps: Vec<u64>,
    overlaps: Vec<OverlapJson>,
}

#[derive(Serialize)]
struct OverlapJson {
    earlier: String,
    later: String,
    overlap_ns: f64,
}

fn stats_json(values: &[u64]) -> StatsJson {
    StatsJson {
        avg: if values.is_empty() {
            0
        } else {
            values.iter().sum::<u64>() / values.len() as u64
        },
        min: values.iter().copied().min().unwrap_or(0),
        max: values.iter().copied().max().unwrap_or(0),
    }
}

fn channels_json(summary: &EventSummary) -> Vec<ChannelJson> {
    summary
        .channels
        .iter()
        .map(|(&(module, channel), c)| ChannelJson {
            module,
            channel,
            events: c.events,
            with_waveform: c.with_waveform,
            mean_energy: c.energy_sum as f64 / c.events.max(1) as f64,
        })
        .collect()
}

fn time_range(meta: &RecordMetadata) -> Option<TimeRangeJson> {
    (meta.event_count > 0).then(|| TimeRangeJson {
        first_ns: meta.first_timestamp_ns,
        last_ns: meta.last_timestamp_ns,
    })
}

// ── dump_record ──────────────────────────────────────────────────────────────

fn dump_record(path: &Path, cli: &Cli) {
    let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {e}", path.display());
        std::process::exit(1);
    });
    let meta = read_record_metadata(path).unwrap_or_else(|e| {
        eprintln!("Error reading record header {}: {e}", path.display());
        std::process::exit(1);
    });

    let compressed: Vec<u64> = meta.frames.iter().map(|f| f.compressed_len).collect();
    let frames_size: u64 = compressed.iter().sum();
    let index_size = meta.frame_count() as u64 * INDEX_ENTRY_SIZE;

    let decoded = if cli.events {
        Some(summarize_events(path).unwrap_or_else(|e| {
            eprintln!("Error decoding {}: {e}", path.display());
            std::process::exit(1);
        }))
    } else {
        None
    };

    if cli.json {
        let json = RecordJson {
            file: file_name(path),
            file_size,
            format: format!("DGR1 v{}", meta.version),
            sequence: sequence_of(path),
            event_count: meta.event_count,
            frame_count: meta.frame_count(),
            sections: SectionsJson {
                header: HEADER_SIZE,
                frames: frames_size,
                index: index_size,
            },
            time_range: time_range(&meta),
            compressed_frame: stats_json(&compressed),
            channels: decoded.as_ref().map(|(s, _)| channels_json(s)),
            out_of_order: decoded.as_ref().map(|(s, _)| s.out_of_order),
            bad_frames: decoded.map(|(_, bad)| bad).unwrap_or_default(),
        };
        print_json(&json);
        return;
    }

    println!("File: {} ({})", file_name(path), format_bytes(file_size));
    if let Some(mtime) = fmt_mtime(path) {
        println!("Written: {mtime}");
    }
    println!(
        "Format: DGR1 v{}, {} events in {} frames",
        meta.version,
        meta.event_count,
        meta.frame_count()
    );

    println!("\nSections:");
    println!("  Header             {} B", HEADER_SIZE);
    println!(
        "  Event frames       {} ({:.1}%)",
        format_bytes(frames_size),
        pct(frames_size, file_size)
    );
    println!(
        "  Index              {} ({:.1}%)",
        format_bytes(index_size),
        pct(index_size, file_size)
    );

    if let Some(range) = time_range(&meta) {
        println!(
            "\nTime range: {} \u{2013} {} (span {})",
            format_timestamp_ns(range.first_ns),
            format_timestamp_ns(range.last_ns),
            format_timestamp_ns(range.last_ns - range.first_ns)
        );
    }
    if !compressed.is_empty() {
        let s = stats_json(&compressed);
        println!(
            "  Compressed frame: avg {} B, min {} B, max {} B",
            s.avg, s.min, s.max
        );
    }

    if let Some((summary, bad_frames)) = decoded {
        println!("\nChannels:");
        println!(
            "  {:>6} {:>7} {:>10} {:>10} {:>11}",
            "Module", "Channel", "Events", "Waveforms", "Mean energy"
        );
        println!("  {}", "─".repeat(48));
        for c in channels_json(&summary) {
            println!(
                "  {:>6} {:>7} {:>10} {:>10} {:>11.1}",
                c.module, c.channel, c.events, c.with_waveform, c.mean_energy
            );
        }
        println!("  {}", "─".repeat(48));
        println!("  {:>6} {:>7} {:>10}", "TOTAL", "", summary.total());

        if summary.total() != meta.event_count && bad_frames.is_empty() {
            println!(
                "\nWARNING: header declares {} events, decoded {}",
                meta.event_count,
                summary.total()
            );
        }
        if summary.out_of_order > 0 {
            println!(
                "\nWARNING: {} events out of timestamp order",
                summary.out_of_order
            );
        }
        for bad in &bad_frames {
            println!("\nERROR: {bad}");
        }
    }
}

// ── dump_directory ───────────────────────────────────────────────────────────

struct RecordEntry {
    path: PathBuf,
    sequence: Option<u64>,
    size: u64,
    meta: RecordMetadata,
}

/// Sorts record files by sequence number; files without one go last, by name.
fn sort_records(records: &mut [RecordEntry]) {
    records.sort_by(|a, b| match (a.sequence, b.sequence) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.path.cmp(&b.path),
    });
}

/// Missing sequence numbers between the lowest and highest present.
fn sequence_gaps(sequences: &[u64]) -> Vec<u64> {
    sequences
        .windows(2)
        .flat_map(|w| (w[0] + 1)..w[1])
        .collect()
}

/// Pairs of consecutive non-empty files whose time ranges overlap.
///
/// Files are cut from a stream sorted per file, so a later file may start
/// before the previous one ended when events arrived late.
fn overlaps(records: &[RecordEntry]) -> Vec<OverlapJson> {
    let filled: Vec<&RecordEntry> = records.iter().filter(|r| r.meta.event_count > 0).collect();
    filled
        .windows(2)
        .filter(|w| w[1].meta.first_timestamp_ns < w[0].meta.last_timestamp_ns)
        .map(|w| OverlapJson {
            earlier: file_name(&w[0].path),
            later: file_name(&w[1].path),
            overlap_ns: w[0].meta.last_timestamp_ns - w[1].meta.first_timestamp_ns,
        })
        .collect()
}

fn dump_directory(path: &Path, cli: &Cli) {
    let entries = fs::read_dir(path).unwrap_or_else(|e| {
        eprintln!("Error reading directory {}: {e}", path.display());
        std::process::exit(1);
    });

    let mut records = Vec::new();
    let mut unreadable = Vec::new();
    for entry in entries.flatten() {
        let p = entry.path();
        if !has_ext(&p, RECORD_EXT) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match read_record_metadata(&p) {
            Ok(meta) => records.push(RecordEntry {
                sequence: sequence_of(&p),
                path: p,
                size,
                meta,
            }),
            Err(e) => unreadable.push(format!("{}: {e}", file_name(&p))),
        }
    }
    sort_records(&mut records);

    let total_size: u64 = records.iter().map(|r| r.size).sum();
    let event_count: u64 = records.iter().map(|r| r.meta.event_count).sum();
    let first = records
        .iter()
        .filter(|r| r.meta.event_count > 0)
        .map(|r| r.meta.first_timestamp_ns)
        .min_by(f64::total_cmp);
    let last = records
        .iter()
        .filter(|r| r.meta.event_count > 0)
        .map(|r| r.meta.last_timestamp_ns)
        .max_by(f64::total_cmp);
    let sequences: Vec<u64> = records.iter().filter_map(|r| r.sequence).collect();
    let gaps = sequence_gaps(&sequences);
    let overlapping = overlaps(&records);

    if cli.json {
        let json = DirectoryJson {
            path: path.display().to_string(),
            files: records.len(),
            unreadable,
            total_size,
            event_count,
            time_range: match (first, last) {
                (Some(first_ns), Some(last_ns)) => Some(TimeRangeJson { first_ns, last_ns }),
                _ => None,
            },
            sequence_gaps: gaps,
            overlaps: overlapping,
        };
        print_json(&json);
        return;
    }

    println!("Records: {}", path.display());
    println!(
        "  {:>6} {:<24} {:>10} {:>10} {:>16} {:>16}",
        "Seq", "File", "Size", "Events", "First", "Last"
    );
    println!("  {}", "─".repeat(88));
    for r in &records {
        let seq = r.sequence.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
        let (first, last) = match time_range(&r.meta) {
            Some(t) => (format_timestamp_ns(t.first_ns), format_timestamp_ns(t.last_ns)),
            None => ("-".into(), "-".into()),
        };
        println!(
            "  {:>6} {:<24} {:>10} {:>10} {:>16} {:>16}",
            seq,
            file_name(&r.path),
            format_bytes(r.size),
            r.meta.event_count,
            first,
            last
        );
    }
    println!("  {}", "─".repeat(88));
    println!(
        "  Total: {} files, {}, {} events",
        records.len(),
        format_bytes(total_size),
        event_count
    );
    if let (Some(first), Some(last)) = (first, last) {
        println!(
            "  Time range: {} \u{2013} {}",
            format_timestamp_ns(first),
            format_timestamp_ns(last)
        );
    }

    if !gaps.is_empty() {
        println!("\nWARNING: missing sequence numbers {:?}", gaps);
    }
    for o in &overlapping {
        println!(
            "\nNOTE: {} starts {} before the end of {}",
            o.later,
            format_timestamp_ns(o.overlap_ns),
            o.earlier
        );
    }
    for u in &unreadable {
        println!("\nERROR: {u}");
    }
}
