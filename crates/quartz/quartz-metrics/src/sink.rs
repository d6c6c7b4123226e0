use crate::record::{CSV_HEADER, MetricsRecord};
use crate::MetricsError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Appends metrics rows to any writer, emitting the header before the first
/// row.
pub struct CsvSink<W: Write> {
    out: W,
    header_written: bool,
}

impl CsvSink<BufWriter<File>> {
    /// Truncates or creates `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| MetricsError::Create {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn write_record(&mut self, record: &MetricsRecord) -> Result<(), MetricsError> {
        if !self.header_written {
            writeln!(self.out, "{CSV_HEADER}")?;
            self.header_written = true;
        }
        writeln!(self.out, "{}", record.to_csv_row())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), MetricsError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_precedes_first_row_only() {
        let mut sink = CsvSink::new(Vec::new());
        let r = MetricsRecord {
            bytes: 7,
            ..Default::default()
        };
        sink.write_record(&r).unwrap();
        sink.write_record(&r).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
    }

    #[test]
    fn create_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir/m.csv");
        let err = CsvSink::create(&missing).err().unwrap();
        assert!(err.to_string().contains("m.csv"));
    }
}
