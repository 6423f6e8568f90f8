//! Reporting of ripe histograms as JSON lines.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use sluice_histogram::{HistogramPoint, ReportError, ReportSink};

/// A [`ReportSink`] that writes every point as one line of JSON.
///
/// Points are written in the order they are reported. The writer is flushed after every point,
/// so that a point is visible downstream once [`report`](ReportSink::report) returns.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
    target: String,
}

impl JsonLinesSink {
    /// Creates a sink writing to the standard output of the process.
    pub fn stdout() -> Self {
        Self::new(io::stdout(), "stdout")
    }

    /// Creates a sink appending to the file at `path`.
    ///
    /// The file is created if it does not exist.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self::new(BufWriter::new(file), path.display().to_string())
    }

    fn new(writer: impl Write + Send + 'static, target: impl Into<String>) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            target: target.into(),
        }
    }
}

impl ReportSink for JsonLinesSink {
    fn report(&self, point: HistogramPoint) -> Result<(), ReportError> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, &point)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesSink")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use sluice_histogram::{AgentDigest, Granularity, HistogramKey};

    use super::*;

    fn point(metric: &str, value: f64) -> HistogramPoint {
        let key = HistogramKey::new(
            Granularity::Hour,
            3_600_000,
            metric,
            "app-1",
            BTreeMap::new(),
        );
        let mut digest = AgentDigest::new(32, 0);
        digest.merge_value(value);
        HistogramPoint::from_digest(&key, digest)
    }

    #[test]
    fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        fs::write(&path, "previous\n").unwrap();

        let sink = JsonLinesSink::open(&path).unwrap();
        sink.report(point("a", 1.0)).unwrap();
        sink.report(point("b", 2.0)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        insta::assert_snapshot!(contents, @r###"
        previous
        {"metric":"a","source":"app-1","tags":{},"timestamp_ms":3600000,"granularity":"hour","centroids":[{"mean":1.0,"count":1}]}
        {"metric":"b","source":"app-1","tags":{},"timestamp_ms":3600000,"granularity":"hour","centroids":[{"mean":2.0,"count":1}]}
        "###);
    }

    #[test]
    fn test_lines_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");

        let sink = JsonLinesSink::open(&path).unwrap();
        let expected = point("request.latency", 12.5);
        sink.report(expected.clone()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: HistogramPoint = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(parsed, expected);
    }
}
