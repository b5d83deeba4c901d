//! Maps `(pair, channel) -> open gzip append stream`, rolling over on
//! calendar-day change. A `DataFile` owns one gzip handle and its
//! open-date; the pool owns the `key -> DataFile` map behind one mutex.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;
use time::{Date, OffsetDateTime};

use crate::error::{Error, Result};
use crate::pair::Pair;

const DEFAULT_PATTERN: &str = "{name}_{ts}.json.gz";

/// Process-local wall-clock time, falling back to UTC if the OS offset
/// can't be determined (e.g. inside some sandboxes/containers).
fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

struct DataFile {
    date: Date,
    encoder: GzEncoder<File>,
}

impl DataFile {
    fn write_line(&mut self, data: &serde_json::Value) -> Result<()> {
        serde_json::to_writer(&mut self.encoder, data)?;
        self.encoder.write_all(b"\n")?;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.encoder.flush()?;
        Ok(())
    }
}

pub struct FileWriterPool {
    data_root: PathBuf,
    pattern: String,
    files: Mutex<HashMap<String, DataFile>>,
}

impl FileWriterPool {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            pattern: DEFAULT_PATTERN.to_string(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    fn key(pair: &Pair, name: &str) -> String {
        format!("{}_{}", pair.symbol(), name)
    }

    fn file_name(&self, name: &str, date: Date) -> String {
        self.pattern
            .replace("{name}", name)
            .replace("{ts}", &date.to_string())
    }

    /// Returns (opening if necessary, rolling if the stored date is no
    /// longer today) the handle for `(pair, name)`, then appends one JSON
    /// line to it. This is the only place day-rollover happens: callers
    /// never hold a handle across calls, they always go through here.
    pub fn write_data(&self, pair: &Pair, name: &str, data: &serde_json::Value) -> Result<()> {
        let key = Self::key(pair, name);
        let today = local_now().date();

        let mut files = self
            .files
            .lock()
            .map_err(|_| Error::Poisoned("file pool lock poisoned"))?;
        let needs_roll = files.get(&key).map(|f| f.date != today).unwrap_or(false);
        if needs_roll {
            if let Some(old) = files.remove(&key) {
                old.close()?;
            }
        }
        if !files.contains_key(&key) {
            let dir = self.data_root.join(pair.symbol());
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(self.file_name(name, today));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            files.insert(
                key.clone(),
                DataFile {
                    date: today,
                    encoder: GzEncoder::new(file, Compression::default()),
                },
            );
        }
        let entry = files.get_mut(&key).expect("just inserted");
        entry.write_line(data)
    }

    /// Closes and evicts the handle for `(pair, name)` if one is open.
    /// Idempotent.
    pub fn close_file(&self, pair: &Pair, name: &str) -> Result<()> {
        let key = Self::key(pair, name);
        let mut files = self
            .files
            .lock()
            .map_err(|_| Error::Poisoned("file pool lock poisoned"))?;
        if let Some(file) = files.remove(&key) {
            file.close()?;
        }
        Ok(())
    }

    /// Closes every open handle. Called at shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| Error::Poisoned("file pool lock poisoned"))?;
        for (_, file) in files.drain() {
            file.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        let file = File::open(path).unwrap();
        let mut decoder = GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        text.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn write_then_decompress_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FileWriterPool::new(dir.path());
        let pair = crate::pair::Pair::new("btc", "usdt");
        let payload = serde_json::json!({"stream": "btcusdt@trade", "data": {"p": "1"}});
        pool.write_data(&pair, "trade", &payload).unwrap();
        pool.shutdown().unwrap();

        let today = local_now().date();
        let path = dir
            .path()
            .join("btcusdt")
            .join(format!("trade_{today}.json.gz"));
        let lines = read_lines(&path);
        assert_eq!(lines, vec![payload]);
    }

    #[test]
    fn close_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FileWriterPool::new(dir.path());
        let pair = crate::pair::Pair::new("btc", "usdt");
        pool.close_file(&pair, "trade").unwrap();
        pool.close_file(&pair, "trade").unwrap();
    }

    #[test]
    fn distinct_channels_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FileWriterPool::new(dir.path());
        let pair = crate::pair::Pair::new("btc", "usdt");
        pool.write_data(&pair, "trade", &serde_json::json!({"a": 1}))
            .unwrap();
        pool.write_data(&pair, "depth", &serde_json::json!({"b": 2}))
            .unwrap();
        pool.shutdown().unwrap();

        let today = local_now().date();
        let trade = dir
            .path()
            .join("btcusdt")
            .join(format!("trade_{today}.json.gz"));
        let depth = dir
            .path()
            .join("btcusdt")
            .join(format!("depth_{today}.json.gz"));
        assert!(trade.exists());
        assert!(depth.exists());
    }
}
