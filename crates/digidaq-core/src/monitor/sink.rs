//! Visualization sinks fed by the monitor's UI pump.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

use super::stats::HistogramSnapshot;
use crate::util::lock;

/// Front end receiving monitor frames.
///
/// Called from the UI pump thread only; implementations may be slow but must
/// not call back into the monitor.
pub trait VisualizationSink: Send + Sync {
    /// Declares a series under a display path (e.g. `/Module00`).
    fn register_series(&self, path: &str, id: &str);

    fn publish_histogram(&self, id: &str, histogram: &HistogramSnapshot);

    fn publish_trace(&self, id: &str, x: &[f64], y: &[f64]);

    /// Marks the end of one publish cycle.
    fn commit(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesData {
    Empty,
    Histogram(HistogramSnapshot),
    Trace { x: Vec<f64>, y: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub path: String,
    pub data: SeriesData,
}

#[derive(Debug, Default, Serialize)]
struct Board {
    frame: u64,
    updated_at: Option<String>,
    series: BTreeMap<String, Series>,
}

/// In-memory series store, optionally mirrored to a JSON file on every commit.
#[derive(Debug, Default)]
pub struct SeriesBoard {
    board: Mutex<Board>,
    output: Option<PathBuf>,
}

impl SeriesBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the whole board to `path` on each commit.
    pub fn with_output(path: impl Into<PathBuf>) -> Self {
        Self {
            board: Mutex::default(),
            output: Some(path.into()),
        }
    }

    pub fn series(&self, id: &str) -> Option<Series> {
        lock(&self.board).series.get(id).cloned()
    }

    pub fn series_ids(&self) -> Vec<String> {
        lock(&self.board).series.keys().cloned().collect()
    }

    pub fn histogram(&self, id: &str) -> Option<HistogramSnapshot> {
        match self.series(id)?.data {
            SeriesData::Histogram(h) => Some(h),
            _ => None,
        }
    }

    pub fn trace(&self, id: &str) -> Option<(Vec<f64>, Vec<f64>)> {
        match self.series(id)?.data {
            SeriesData::Trace { x, y } => Some((x, y)),
            _ => None,
        }
    }

    /// Number of completed publish cycles.
    pub fn frames(&self) -> u64 {
        lock(&self.board).frame
    }

    fn update(&self, id: &str, data: SeriesData) {
        let mut board = lock(&self.board);
        match board.series.get_mut(id) {
            Some(series) => series.data = data,
            None => {
                board.series.insert(
                    id.to_string(),
                    Series {
                        path: "/".to_string(),
                        data,
                    },
                );
            }
        }
    }
}

impl VisualizationSink for SeriesBoard {
    fn register_series(&self, path: &str, id: &str) {
        lock(&self.board).series.insert(
            id.to_string(),
            Series {
                path: path.to_string(),
                data: SeriesData::Empty,
            },
        );
    }

    fn publish_histogram(&self, id: &str, histogram: &HistogramSnapshot) {
        self.update(id, SeriesData::Histogram(histogram.clone()));
    }

    fn publish_trace(&self, id: &str, x: &[f64], y: &[f64]) {
        self.update(
            id,
            SeriesData::Trace {
                x: x.to_vec(),
                y: y.to_vec(),
            },
        );
    }

    fn commit(&self) -> io::Result<()> {
        let json = {
            let mut board = lock(&self.board);
            board.frame += 1;
            board.updated_at = Some(chrono::Utc::now().to_rfc3339());
            if self.output.is_none() {
                return Ok(());
            }
            serde_json::to_vec(&*board).map_err(io::Error::other)?
        };
        let Some(path) = &self.output else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hist(bins: Vec<u64>) -> HistogramSnapshot {
        HistogramSnapshot {
            min: 0.0,
            max: bins.len() as f64,
            bins,
            underflow: 0,
            overflow: 1,
        }
    }

    #[test]
    fn test_publish_overwrites_registered_series() {
        let board = SeriesBoard::new();
        board.register_series("/Module00", "hist_00_00");
        board.publish_histogram("hist_00_00", &hist(vec![1, 2]));
        board.publish_histogram("hist_00_00", &hist(vec![3, 4]));

        let series = board.series("hist_00_00").unwrap();
        assert_eq!(series.path, "/Module00");
        assert_eq!(board.histogram("hist_00_00").unwrap().bins, vec![3, 4]);
        assert!(board.trace("hist_00_00").is_none());
    }

    #[test]
    fn test_commit_writes_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor/board.json");
        let board = SeriesBoard::with_output(&path);
        board.register_series("/Module01", "trace_01_00_ap1");
        board.publish_trace("trace_01_00_ap1", &[0.0, 4.0], &[10.0, 12.0]);
        board.commit().unwrap();
        board.commit().unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["frame"], 2);
        let series = &value["series"]["trace_01_00_ap1"];
        assert_eq!(series["path"], "/Module01");
        assert_eq!(series["data"]["kind"], "trace");
        assert_eq!(series["data"]["y"][1], 12.0);
        assert!(!dir.path().join("monitor/board.json.tmp").exists());
    }

    #[test]
    fn test_commit_without_output_counts_frames() {
        let board = SeriesBoard::new();
        board.commit().unwrap();
        assert_eq!(board.frames(), 1);
    }
}
