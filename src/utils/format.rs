//! Formatting utilities for human-readable output

/// Bytes per megabyte constant
pub const MB: u64 = 1024 * 1024;

/// Convert bytes to megabytes as f64 (for logging)
#[inline]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB as f64
}

/// Format bytes into human-readable size string (e.g., "1.5 MB", "256 KB")
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Render a version date the way the flash success message shows it (`2023.6.1`)
pub fn format_version(date: chrono::NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}.{}.{}", date.year(), date.month(), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1536), "2 KB");
        assert_eq!(format_size(1048576), "1.0 MB");
        assert_eq!(format_size(1572864), "1.5 MB");
    }

    #[test]
    fn test_bytes_to_mb() {
        assert!((bytes_to_mb(0) - 0.0).abs() < f64::EPSILON);
        assert!((bytes_to_mb(1048576) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_format_version_drops_padding() {
        let date = chrono::NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        assert_eq!(format_version(date), "2023.6.1");
    }
}
