//! digidaqd - digitizer acquisition daemon.
//!
//! Reads a list of source configs, acquires from every digitizer in
//! parallel, records the event stream into size/age-rotated files and keeps
//! live histograms and traces. Type `r` + Enter to reload the configs,
//! `q` + Enter (or Ctrl-C) to stop.

mod control;

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
/// Called after a reload, when the engines dropped their drained buffers.
fn release_memory_to_os() {
    // SAFETY: mallctl is called with a valid NUL-terminated name and no
    // input/output buffers, which is the documented form for purge commands.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use digidaq_core::fmt::{format_bytes, format_rate};
use digidaq_core::monitor::{MonitorConfig, SeriesBoard, VisualizationSink};
use digidaq_core::orchestrator::{Orchestrator, PipelineConfig, RunSummary};
use digidaq_core::recording::RecordingConfig;
use digidaq_core::source::{EventSource, SimulatedDigitizer, SourceConfig, load_source_configs};
use digidaq_core::storage::ChunkFileSink;
use digidaq_core::util::parse_size;

use control::{Command, CommandReader};

/// Digitizer acquisition daemon.
#[derive(Parser)]
#[command(name = "digidaqd", about = "Digitizer acquisition daemon", version)]
struct Args {
    /// Text file listing one source config (JSON) per line.
    #[arg(default_value = "config.list")]
    config_list: PathBuf,

    /// Force waveform capture on every source.
    #[arg(short = 'w', long)]
    waveform: bool,

    /// Record file prefix; files are named <prefix>_<n>.dgr.
    #[arg(short, long, default_value = "./data/run")]
    output: String,

    /// Maximum size of one record file (e.g., "100M", "1G").
    #[arg(long, default_value = "100M", value_parser = parse_size)]
    max_size: u64,

    /// Maximum age of one record file in minutes.
    #[arg(long, default_value = "30")]
    max_minutes: u64,

    /// Monitor only, do not write record files.
    #[arg(long)]
    no_record: bool,

    /// Write the monitor histograms and traces to this JSON file.
    #[arg(long, value_name = "PATH")]
    monitor_file: Option<PathBuf>,

    /// Monitor publish period in milliseconds.
    #[arg(long, default_value = "500")]
    ui_interval_ms: u64,

    /// Number of recording converter threads.
    #[arg(long, default_value = "4")]
    converters: usize,

    /// Number of recording writer threads.
    #[arg(long, default_value = "2")]
    writers: usize,

    /// Stop after this many seconds (0 = run until stopped).
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["digidaqd", "digidaq_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Creates the driver for a source URL.
fn make_source(config: &SourceConfig) -> Result<Box<dyn EventSource>, String> {
    match config.url.split_once("://") {
        Some(("sim", _)) => Ok(Box::new(SimulatedDigitizer::new())),
        _ => Err(format!("no driver for source url '{}'", config.url)),
    }
}

/// Logs the error and exits with status 1. Used for configuration faults.
fn fatal(msg: impl std::fmt::Display) -> ! {
    error!("{}", msg);
    eprintln!("digidaqd: {}", msg);
    std::process::exit(1);
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Total time: {:.1} s, {} events, event rate: {}",
        summary.elapsed.as_secs_f64(),
        summary.routed_events,
        format_rate(summary.event_rate)
    );
    if let Some(rec) = &summary.recording {
        println!(
            "Recorded {} events in {} files ({})",
            rec.written_events,
            rec.files_written,
            format_bytes(rec.written_bytes)
        );
        for fault in &rec.faults {
            println!(
                "  not written: {} ({} events): {}",
                fault.file.display(),
                fault.events,
                fault.cause
            );
        }
    }
    if summary.acquisition.faults > 0 {
        println!("Source faults: {}", summary.acquisition.faults);
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("digidaqd {} starting", env!("CARGO_PKG_VERSION"));

    let configs = load_source_configs(&args.config_list, args.waveform)
        .unwrap_or_else(|e| fatal(format!("configuration: {}", e)));
    let sources: Vec<Box<dyn EventSource>> = configs
        .iter()
        .map(make_source)
        .collect::<Result<_, _>>()
        .unwrap_or_else(|e| fatal(format!("configuration: {}", e)));
    info!(
        "Config: {} sources from {}, waveforms forced: {}",
        configs.len(),
        args.config_list.display(),
        args.waveform
    );

    let recording = (!args.no_record).then(|| RecordingConfig {
        file_prefix: args.output.clone(),
        max_file_bytes: args.max_size,
        max_file_age: Duration::from_secs(args.max_minutes.max(1) * 60),
        converter_threads: args.converters,
        writer_threads: args.writers,
        ..RecordingConfig::default()
    });
    match &recording {
        Some(rec) => info!(
            "Recording: prefix={}, max_size={}, max_age={}min",
            rec.file_prefix,
            format_bytes(rec.max_file_bytes),
            rec.max_file_age.as_secs() / 60
        ),
        None => info!("Recording: disabled"),
    }

    let config = PipelineConfig {
        recording,
        monitor: MonitorConfig {
            ui_period: Duration::from_millis(args.ui_interval_ms.max(10)),
            ..MonitorConfig::default()
        },
        ..PipelineConfig::default()
    };
    let board: Arc<dyn VisualizationSink> = match &args.monitor_file {
        Some(path) => Arc::new(SeriesBoard::with_output(path)),
        None => Arc::new(SeriesBoard::new()),
    };

    let mut orch = Orchestrator::open(config, sources, &configs, Arc::new(ChunkFileSink), board)
        .unwrap_or_else(|e| fatal(format!("configuration: {}", e)));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let commands = match CommandReader::spawn() {
        Ok(reader) => Some(reader),
        Err(e) => {
            warn!("Keyboard control disabled: {}", e);
            None
        }
    };

    if let Err(e) = orch.start() {
        fatal(format!("start: {}", e));
    }
    info!(
        "Acquisition started at {} (q: quit, r: reload)",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let status_interval = Duration::from_secs(10);
    let mut last_status = Instant::now();
    let mut events_at_status = 0u64;
    let mut routed_total = 0u64;

    while running.load(Ordering::SeqCst) {
        match commands.as_ref().and_then(CommandReader::try_next) {
            Some(Command::Quit) => {
                info!("Quit requested");
                break;
            }
            Some(Command::Reload) => {
                match load_source_configs(&args.config_list, args.waveform) {
                    Ok(new_configs) => match orch.reload(&new_configs) {
                        Ok(()) => info!("Reload complete"),
                        Err(e) => error!("Reload failed: {}", e),
                    },
                    Err(e) => error!("Reload aborted, keeping current settings: {}", e),
                }
                release_memory_to_os();
                debug!("Memory released after reload");
            }
            None => {}
        }

        let routed = orch.route();
        routed_total += routed as u64;
        if routed == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        if last_status.elapsed() >= status_interval {
            let rate = (routed_total - events_at_status) as f64 / last_status.elapsed().as_secs_f64();
            let acq = orch.acquisition().stats();
            match orch.recording().map(|r| r.stats()) {
                Some(rec) => info!(
                    "Status: {} events ({}), {} files written, {} pending, {} source faults",
                    routed_total,
                    format_rate(rate),
                    rec.files_written,
                    rec.pending_events,
                    acq.faults
                ),
                None => info!(
                    "Status: {} events ({}), {} source faults",
                    routed_total,
                    format_rate(rate),
                    acq.faults
                ),
            }
            last_status = Instant::now();
            events_at_status = routed_total;
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Run duration reached");
            break;
        }
    }

    info!("Shutting down...");
    let summary = orch.close();
    print_summary(&summary);
    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use digidaq_core::source::Firmware;

    fn config(url: &str) -> SourceConfig {
        SourceConfig {
            url: url.to_string(),
            firmware: Firmware::Pha,
            module_id: 0,
            serial_number: None,
            channels: 8,
            sample_rate_msps: 500,
            record_length: 256,
            waveforms: false,
            event_rate_hz: 100.0,
            seed: None,
            parameters: Default::default(),
        }
    }

    #[test]
    fn make_source_accepts_sim_scheme() {
        assert!(make_source(&config("sim://bench0")).is_ok());
        let err = make_source(&config("dig2://10.0.0.1")).err().unwrap();
        assert!(err.contains("dig2://10.0.0.1"));
    }

    #[test]
    fn args_parse_sizes_and_flags() {
        let args = Args::parse_from(["digidaqd", "list.txt", "-w", "--max-size", "1G", "--no-record"]);
        assert_eq!(args.config_list, PathBuf::from("list.txt"));
        assert!(args.waveform);
        assert!(args.no_record);
        assert_eq!(args.max_size, 1024 * 1024 * 1024);
        assert_eq!(args.max_minutes, 30);
    }
}
