//! Durable results keyed by job identity and request fingerprint.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::fingerprint::RequestFingerprint;
use super::job::JobId;
use super::outcome::FailureKind;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    #[snafu(display("Failed to open cache file {}: {}", path.display(), source))]
    Open { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to read cache file {}: {}", path.display(), source))]
    Read { path: PathBuf, source: std::io::Error },

    #[snafu(display("Corrupt cache entry at {}:{}: {}", path.display(), line, source))]
    Decode {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to encode cache entry: {}", source))]
    Encode { source: serde_json::Error },

    #[snafu(display("Failed to write cache entry: {}", source))]
    Write { source: std::io::Error },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub job_id: JobId,
    pub fingerprint: RequestFingerprint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub ratio: f64,
    pub payload: serde_json::Value,
    pub latency: Duration,
}

/// Diagnostic record of a job that exhausted its attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// `None` for timeouts and rate limits.
    pub kind: Option<FailureKind>,
    pub message: String,
    pub attempts: u32,
}

/// Result storage consulted before and written after each remote call.
///
/// Implementations must be safe for concurrent writers of distinct keys;
/// `put` is idempotent.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError>;

    fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), CacheError>;

    /// Records a terminal failure. Never visible through [`ResultCache::get`].
    fn record_failure(&self, key: &CacheKey, failure: &FailureRecord) -> Result<(), CacheError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory cache; contents are lost at exit.
#[derive(Debug, Default)]
pub struct MemoryCache {
    results: Mutex<HashMap<CacheKey, CachedResult>>,
    failures: Mutex<Vec<(CacheKey, FailureRecord)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.results).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self) -> Vec<(CacheKey, FailureRecord)> {
        lock(&self.failures).clone()
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        Ok(lock(&self.results).get(key).cloned())
    }

    fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), CacheError> {
        lock(&self.results).insert(key.clone(), result.clone());
        Ok(())
    }

    fn record_failure(&self, key: &CacheKey, failure: &FailureRecord) -> Result<(), CacheError> {
        lock(&self.failures).push((key.clone(), failure.clone()));
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ResultLine {
    key: CacheKey,
    result: CachedResult,
}

#[derive(Serialize)]
struct FailureLine<'a> {
    key: &'a CacheKey,
    failure: &'a FailureRecord,
}

/// Append-only JSON-lines cache.
///
/// Results are read into memory on open; later lines for the same key win.
/// Failures go to a separate log that is never read back.
#[derive(Debug)]
pub struct JsonLinesCache {
    index: Mutex<HashMap<CacheKey, CachedResult>>,
    results: Mutex<File>,
    failures: Mutex<File>,
}

impl JsonLinesCache {
    pub fn open(results_path: impl AsRef<Path>, failures_path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let results_path = results_path.as_ref();
        let failures_path = failures_path.as_ref();

        let index = load_index(results_path)?;
        debug!(
            target: "adaptive_batch::cache",
            path = %results_path.display(),
            entries = index.len(),
            "Loaded result cache"
        );

        Ok(Self {
            index: Mutex::new(index),
            results: Mutex::new(open_append(results_path)?),
            failures: Mutex::new(open_append(failures_path)?),
        })
    }
}

fn open_append(path: &Path) -> Result<File, CacheError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(OpenSnafu { path })
}

fn load_index(path: &Path) -> Result<HashMap<CacheKey, CachedResult>, CacheError> {
    let mut index = HashMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(source) => return Err(CacheError::Open { path: path.to_path_buf(), source }),
    };
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context(ReadSnafu { path })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: ResultLine =
            serde_json::from_str(&line).context(DecodeSnafu { path, line: n + 1 })?;
        index.insert(entry.key, entry.result);
    }
    Ok(index)
}

fn append_line<T: Serialize>(file: &Mutex<File>, value: &T) -> Result<(), CacheError> {
    let mut encoded = serde_json::to_vec(value).context(EncodeSnafu)?;
    encoded.push(b'\n');
    let mut file = lock(file);
    file.write_all(&encoded).context(WriteSnafu)?;
    file.flush().context(WriteSnafu)
}

impl ResultCache for JsonLinesCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, CacheError> {
        Ok(lock(&self.index).get(key).cloned())
    }

    fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), CacheError> {
        append_line(
            &self.results,
            &ResultLine {
                key: key.clone(),
                result: result.clone(),
            },
        )?;
        lock(&self.index).insert(key.clone(), result.clone());
        Ok(())
    }

    fn record_failure(&self, key: &CacheKey, failure: &FailureRecord) -> Result<(), CacheError> {
        append_line(&self.failures, &FailureLine { key, failure })
    }
}
