use crate::MetricsError;
use serde::Serialize;

/// Column header of every metrics file.
pub const CSV_HEADER: &str = "active_time_sec,wall_time_sec,bytes,rss_mb";

/// One metrics row. `peak_rss_mb` is written to the `rss_mb` column.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MetricsRecord {
    pub active_time_sec: f64,
    pub wall_time_sec: f64,
    pub bytes: u64,
    pub peak_rss_mb: f64,
}

impl MetricsRecord {
    pub fn to_csv_row(&self) -> String {
        format!(
            "{:.6},{:.6},{},{:.2}",
            self.active_time_sec, self.wall_time_sec, self.bytes, self.peak_rss_mb
        )
    }

    pub fn parse_csv_row(line: &str) -> Result<Self, MetricsError> {
        let err = |reason: &str| MetricsError::Parse {
            line: line.to_string(),
            reason: reason.to_string(),
        };
        let fields: Vec<&str> = line.trim().split(',').collect();
        let [active, wall, bytes, rss] = fields.as_slice() else {
            return Err(err("expected 4 columns"));
        };
        Ok(Self {
            active_time_sec: active.parse().map_err(|_| err("bad active_time_sec"))?,
            wall_time_sec: wall.parse().map_err(|_| err("bad wall_time_sec"))?,
            bytes: bytes.parse().map_err(|_| err("bad bytes"))?,
            peak_rss_mb: rss.parse().map_err(|_| err("bad rss_mb"))?,
        })
    }

    /// Last data row of a metrics file, which is the run total.
    pub fn last_in_csv(contents: &str) -> Result<Option<Self>, MetricsError> {
        contents
            .lines()
            .filter(|l| !l.trim().is_empty() && l.trim() != CSV_HEADER)
            .next_back()
            .map(Self::parse_csv_row)
            .transpose()
    }

    pub fn mib_per_sec(&self, seconds: f64) -> f64 {
        if seconds > 0.0 {
            self.bytes as f64 / (1024.0 * 1024.0) / seconds
        } else {
            0.0
        }
    }

    pub fn gbit_per_sec(&self, seconds: f64) -> f64 {
        if seconds > 0.0 {
            self.bytes as f64 * 8.0 / 1e9 / seconds
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_matches_header_columns() {
        let r = MetricsRecord {
            active_time_sec: 1.5,
            wall_time_sec: 2.0,
            bytes: 4096,
            peak_rss_mb: 12.345,
        };
        let row = r.to_csv_row();
        assert_eq!(row, "1.500000,2.000000,4096,12.35");
        assert_eq!(
            row.split(',').count(),
            CSV_HEADER.split(',').count()
        );
        let back = MetricsRecord::parse_csv_row(&row).unwrap();
        assert_eq!(back.bytes, 4096);
    }

    #[test]
    fn last_row_is_the_total() {
        let file = format!("{CSV_HEADER}\n0.1,0.2,100,5.0\n0.3,0.4,300,6.0\n");
        let last = MetricsRecord::last_in_csv(&file).unwrap().unwrap();
        assert_eq!(last.bytes, 300);
        assert_eq!(MetricsRecord::last_in_csv(CSV_HEADER).unwrap(), None);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(MetricsRecord::parse_csv_row("1,2,3").is_err());
        assert!(MetricsRecord::parse_csv_row("1,2,x,4").is_err());
    }

    #[test]
    fn throughput_units() {
        let r = MetricsRecord {
            bytes: 1024 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(r.mib_per_sec(2.0), 512.0);
        assert!((r.gbit_per_sec(1.0) - 8.589934592).abs() < 1e-9);
        assert_eq!(r.mib_per_sec(0.0), 0.0);
    }
}
