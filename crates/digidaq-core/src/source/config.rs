//! Digitizer configuration files.
//!
//! A run is described by a *config list*: a text file naming one JSON
//! configuration per digitizer. Lines that are blank or start with `#` are
//! ignored. Every problem found here is fatal at startup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration error. Raised before acquisition starts; not recoverable.
#[derive(Debug)]
pub enum ConfigError {
    /// A listed file does not exist.
    MissingFile(PathBuf),
    /// A file exists but could not be read.
    Io { path: PathBuf, source: io::Error },
    /// A source config is not valid JSON or misses fields.
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// A value is out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingFile(path) => write!(f, "file does not exist: {}", path.display()),
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Parse { path, source } => {
                write!(f, "{}: invalid config: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Digitizer firmware, selecting the readout format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Firmware {
    /// Pulse shape discrimination: long and short gate integrals.
    #[serde(rename = "DPP-PSD")]
    Psd,
    /// Pulse height analysis: no short gate.
    #[serde(rename = "DPP-PHA")]
    Pha,
    /// Oscilloscope mode: one record per channel per trigger.
    #[serde(rename = "SCOPE")]
    Scope,
}

impl std::fmt::Display for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Firmware::Psd => write!(f, "DPP-PSD"),
            Firmware::Pha => write!(f, "DPP-PHA"),
            Firmware::Scope => write!(f, "SCOPE"),
        }
    }
}

/// Per-digitizer configuration, loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Device address, e.g. `dig2://192.168.0.10` or `sim://bench0`.
    pub url: String,
    pub firmware: Firmware,
    /// Module number stamped on every event. Must fit in a byte.
    pub module_id: u32,
    #[serde(default)]
    pub serial_number: Option<String>,
    pub channels: u32,
    /// ADC sampling rate in mega-samples per second.
    pub sample_rate_msps: u32,
    /// Samples per waveform record.
    #[serde(default = "default_record_length")]
    pub record_length: u32,
    /// Capture probe traces with each event.
    #[serde(default)]
    pub waveforms: bool,
    /// Mean trigger rate of the simulated digitizer.
    #[serde(default = "default_event_rate")]
    pub event_rate_hz: f64,
    /// Seed for the simulated digitizer; derived from the module id when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Device parameters passed through untouched (module/channel/trace settings).
    #[serde(default)]
    pub parameters: serde_json::Value,
}

fn default_record_length() -> u32 {
    512
}

fn default_event_rate() -> f64 {
    1000.0
}

impl SourceConfig {
    /// Reads and validates one source config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SourceConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.module_id > u8::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "{}: module id {} out of range (0..=255)",
                self.url, self.module_id
            )));
        }
        if self.channels == 0 || self.channels > 256 {
            return Err(ConfigError::Invalid(format!(
                "{}: channel count {} out of range (1..=256)",
                self.url, self.channels
            )));
        }
        if self.sample_rate_msps == 0 || self.sample_rate_msps > 1000 {
            return Err(ConfigError::Invalid(format!(
                "{}: sample rate {} Msps out of range (1..=1000)",
                self.url, self.sample_rate_msps
            )));
        }
        if self.waveforms && self.record_length == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: waveforms enabled with zero record length",
                self.url
            )));
        }
        if !self.event_rate_hz.is_finite() || self.event_rate_hz < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "{}: event rate must be a non-negative number",
                self.url
            )));
        }
        Ok(())
    }

    pub fn module(&self) -> u8 {
        self.module_id.min(u8::MAX as u32) as u8
    }

    /// Nanoseconds between two ADC samples.
    pub fn sample_interval_ns(&self) -> u32 {
        1000 / self.sample_rate_msps.max(1)
    }
}

/// Reads a config list and returns the listed paths.
///
/// Relative entries are resolved against the list file's directory.
pub fn load_config_list(list: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if !list.exists() {
        return Err(ConfigError::MissingFile(list.to_path_buf()));
    }
    let content = fs::read_to_string(list).map_err(|source| ConfigError::Io {
        path: list.to_path_buf(),
        source,
    })?;
    let base = list.parent().unwrap_or_else(|| Path::new("."));

    let mut paths = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let path = Path::new(line);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        };
        if !path.exists() {
            return Err(ConfigError::MissingFile(path));
        }
        paths.push(path);
    }

    if paths.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{}: no source configurations listed",
            list.display()
        )));
    }
    Ok(paths)
}

/// Loads every source config named by a config list.
///
/// `force_trace` turns on waveform capture for every source. Module ids must
/// be unique across the run.
pub fn load_source_configs(list: &Path, force_trace: bool) -> Result<Vec<SourceConfig>, ConfigError> {
    let mut configs = Vec::new();
    for path in load_config_list(list)? {
        let mut config = SourceConfig::from_file(&path)?;
        if force_trace {
            config.waveforms = true;
        }
        if configs
            .iter()
            .any(|c: &SourceConfig| c.module_id == config.module_id)
        {
            return Err(ConfigError::Invalid(format!(
                "{}: duplicate module id {}",
                path.display(),
                config.module_id
            )));
        }
        configs.push(config);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PSD_CONFIG: &str = r#"{
        "url": "sim://bench0",
        "firmware": "DPP-PSD",
        "module_id": 3,
        "channels": 16,
        "sample_rate_msps": 500,
        "parameters": {"module_parameters": []}
    }"#;

    #[test]
    fn test_parse_source_config_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mod3.json");
        std::fs::write(&path, PSD_CONFIG).unwrap();

        let config = SourceConfig::from_file(&path).unwrap();
        assert_eq!(config.firmware, Firmware::Psd);
        assert_eq!(config.module(), 3);
        assert_eq!(config.record_length, 512);
        assert!(!config.waveforms);
        assert_eq!(config.sample_interval_ns(), 2);
    }

    #[test]
    fn test_module_id_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, PSD_CONFIG.replace("\"module_id\": 3", "\"module_id\": 300"))
            .unwrap();

        let err = SourceConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("module id 300"));
    }

    #[test]
    fn test_unknown_firmware_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, PSD_CONFIG.replace("DPP-PSD", "DPP-ZLE")).unwrap();

        let err = SourceConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_list_skips_comments_and_resolves_relative() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("mod3.json"), PSD_CONFIG).unwrap();
        let list = dir.path().join("configList");
        std::fs::write(&list, "# digitizers\n\nmod3.json\n").unwrap();

        let paths = load_config_list(&list).unwrap();
        assert_eq!(paths, vec![dir.path().join("mod3.json")]);
    }

    #[test]
    fn test_config_list_missing_entry_is_fatal() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("configList");
        std::fs::write(&list, "nowhere.json\n").unwrap();

        let err = load_config_list(&list).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_force_trace_and_duplicate_modules() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), PSD_CONFIG).unwrap();
        std::fs::write(dir.path().join("b.json"), PSD_CONFIG).unwrap();

        let list = dir.path().join("single");
        std::fs::write(&list, "a.json\n").unwrap();
        let configs = load_source_configs(&list, true).unwrap();
        assert!(configs[0].waveforms);

        let list = dir.path().join("dup");
        std::fs::write(&list, "a.json\nb.json\n").unwrap();
        assert!(matches!(
            load_source_configs(&list, false),
            Err(ConfigError::Invalid(_))
        ));
    }
}
