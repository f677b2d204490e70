use super::TrackingError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// A scalar reported to the tracking store.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricEntry {
    /// Name of the plot, e.g. `cost`.
    pub title: String,
    /// Name of the series inside the plot, e.g. `train`.
    pub series: String,
    pub iteration: usize,
    pub value: f64,
}

impl MetricEntry {
    pub fn new(title: &str, series: &str, iteration: usize, value: f64) -> Self {
        Self {
            title: title.to_string(),
            series: series.to_string(),
            iteration,
            value,
        }
    }
}

/// Metric logger.
pub trait MetricLogger {
    /// Logs an item.
    fn log(&mut self, item: &MetricEntry) -> Result<(), TrackingError>;
}

/// Appends each title to `<directory>/<title>.log` as `series,iteration,value` lines.
pub struct FileMetricLogger {
    writers: HashMap<String, BufWriter<File>>,
    directory: PathBuf,
}

impl FileMetricLogger {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            writers: HashMap::new(),
            directory: directory.into(),
        }
    }
}

impl MetricLogger for FileMetricLogger {
    fn log(&mut self, item: &MetricEntry) -> Result<(), TrackingError> {
        let path = self.directory.join(format!("{}.log", item.title));

        let writer = match self.writers.entry(item.title.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = std::fs::create_dir_all(&self.directory)
                    .and_then(|_| File::options().create(true).append(true).open(&path))
                    .map_err(|source| TrackingError::Io {
                        path: path.clone(),
                        source,
                    })?;

                entry.insert(BufWriter::new(file))
            }
        };

        writeln!(writer, "{},{},{}", item.series, item.iteration, item.value)
            .and_then(|_| writer.flush())
            .map_err(|source| TrackingError::Io { path, source })
    }
}

/// In memory metric logger, useful when no tracking store is attached.
#[derive(Default)]
pub struct InMemoryMetricLogger {
    pub entries: Vec<MetricEntry>,
}

impl InMemoryMetricLogger {
    /// Values of one series, in logging order.
    pub fn values(&self, title: &str, series: &str) -> Vec<f64> {
        self.entries
            .iter()
            .filter(|entry| entry.title == title && entry.series == series)
            .map(|entry| entry.value)
            .collect()
    }
}

impl MetricLogger for InMemoryMetricLogger {
    fn log(&mut self, item: &MetricEntry) -> Result<(), TrackingError> {
        self.entries.push(item.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logger_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = FileMetricLogger::new(dir.path().join("scalars"));

        logger.log(&MetricEntry::new("cost", "train", 1, 2.5)).unwrap();
        logger.log(&MetricEntry::new("cost", "train", 2, 1.25)).unwrap();
        logger.log(&MetricEntry::new("accuracy", "test", 2, 0.5)).unwrap();

        let cost = std::fs::read_to_string(dir.path().join("scalars/cost.log")).unwrap();
        let accuracy = std::fs::read_to_string(dir.path().join("scalars/accuracy.log")).unwrap();
        assert_eq!(cost, "train,1,2.5\ntrain,2,1.25\n");
        assert_eq!(accuracy, "test,2,0.5\n");
    }

    #[test]
    fn in_memory_logger_filters_by_series() {
        let mut logger = InMemoryMetricLogger::default();

        logger.log(&MetricEntry::new("cost", "train", 1, 3.0)).unwrap();
        logger.log(&MetricEntry::new("cost", "valid", 1, 4.0)).unwrap();
        logger.log(&MetricEntry::new("cost", "train", 2, 2.0)).unwrap();

        assert_eq!(logger.values("cost", "train"), vec![3.0, 2.0]);
        assert_eq!(logger.values("accuracy", "train"), Vec::<f64>::new());
    }
}
