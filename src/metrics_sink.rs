//! エポックごとの指標の出力先

use std::fs::File;
use std::path::Path;

use tracing::info;

use crate::error::{MilError, MilResult};
use crate::ml::evaluation::MetricValue;

/// 名前付きスカラー指標を受け取る
pub trait MetricsSink {
    fn record(&mut self, epoch: usize, name: &str, value: MetricValue) -> MilResult<()>;

    fn flush(&mut self) -> MilResult<()> {
        Ok(())
    }
}

/// tracingのinfoとして出力
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record(&mut self, epoch: usize, name: &str, value: MetricValue) -> MilResult<()> {
        info!(epoch, metric = name, value = %value, "指標");
        Ok(())
    }
}

/// `epoch,metric,value` 形式のCSV
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub fn create(path: &Path) -> MilResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MilError::MetricsSink(e.to_string()))?;
        }
        let mut writer = csv::Writer::from_path(path).map_err(|e| MilError::MetricsSink(e.to_string()))?;
        writer
            .write_record(["epoch", "metric", "value"])
            .map_err(|e| MilError::MetricsSink(e.to_string()))?;
        Ok(Self { writer })
    }
}

impl MetricsSink for CsvSink {
    fn record(&mut self, epoch: usize, name: &str, value: MetricValue) -> MilResult<()> {
        let value = match value {
            MetricValue::Scalar(v) => v.to_string(),
            MetricValue::NotComputable => String::new(),
        };
        self.writer
            .write_record([epoch.to_string().as_str(), name, value.as_str()])
            .map_err(|e| MilError::MetricsSink(e.to_string()))
    }

    fn flush(&mut self) -> MilResult<()> {
        self.writer.flush().map_err(|e| MilError::MetricsSink(e.to_string()))
    }
}

/// 記録をメモリに保持
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<(usize, String, MetricValue)>,
}

impl MemorySink {
    /// `name` の値をエポック順に返す
    pub fn values(&self, name: &str) -> Vec<(usize, MetricValue)> {
        self.records
            .iter()
            .filter(|(_, n, _)| n == name)
            .map(|(epoch, _, value)| (*epoch, *value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, epoch: usize, name: &str, value: MetricValue) -> MilResult<()> {
        self.records.push((epoch, name.to_string(), value));
        Ok(())
    }
}

/// 複数の出力先へ同じ指標を送る
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for MultiSink {
    fn record(&mut self, epoch: usize, name: &str, value: MetricValue) -> MilResult<()> {
        for sink in &mut self.sinks {
            sink.record(epoch, name, value)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> MilResult<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_sink_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/metrics.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.record(0, "train_acc", MetricValue::Scalar(0.5)).unwrap();
        sink.record(0, "fpr", MetricValue::NotComputable).unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "epoch,metric,value\n0,train_acc,0.5\n0,fpr,\n");
    }

    #[test]
    fn test_memory_sink_filters_by_name() {
        let mut sink = MemorySink::default();
        sink.record(0, "train_loss", MetricValue::Scalar(0.7)).unwrap();
        sink.record(0, "lr", MetricValue::Scalar(1e-3)).unwrap();
        sink.record(1, "train_loss", MetricValue::Scalar(0.6)).unwrap();

        assert_eq!(
            sink.values("train_loss"),
            vec![(0, MetricValue::Scalar(0.7)), (1, MetricValue::Scalar(0.6))]
        );
    }
}
