//! Formatting helpers for log lines and the dump tool.

/// Format byte count as human-readable size: `"1.5 GiB"`, `"100.3 MiB"`, `"512 B"`.
pub fn format_bytes(bytes: u64) -> String {
    let f = bytes as f64;
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1} GiB", f / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", f / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", f / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Format an event rate: `"1.2M/s"`, `"35.0K/s"`, `"12/s"`.
pub fn format_rate(rate: f64) -> String {
    if rate < 0.01 {
        return "0/s".to_string();
    }
    if rate >= 1_000_000.0 {
        format!("{:.1}M/s", rate / 1_000_000.0)
    } else if rate >= 1_000.0 {
        format!("{:.1}K/s", rate / 1_000.0)
    } else if rate >= 10.0 {
        format!("{:.0}/s", rate)
    } else {
        format!("{:.1}/s", rate)
    }
}

/// Format a nanosecond timestamp as seconds with microsecond precision.
pub fn format_timestamp_ns(ns: f64) -> String {
    format!("{:.6} s", ns / 1e9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.0 MiB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0.0), "0/s");
        assert_eq!(format_rate(5.0), "5.0/s");
        assert_eq!(format_rate(35_000.0), "35.0K/s");
        assert_eq!(format_rate(1_200_000.0), "1.2M/s");
    }
}
