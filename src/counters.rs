//! # Counter Store
//!
//! Crash-safe record of how many messages were sent and what they cost.
//!
//! ```text
//! {"version":1,"sent_count":3,"total_cost":4.5,"updated_at":"2024-05-01T12:00:00Z"}
//! ```
//!
//! Writes go to a temp file in the same directory which is fsynced and renamed
//! over the record, then the directory is fsynced. A sidecar `<file>.lock`
//! holds an exclusive advisory lock for the duration of the write so two
//! processes sharing the file never interleave. The in-memory snapshot only
//! changes after the rename succeeded: a failed write leaves both the file and
//! the snapshot at the previous value.
//!
//! Records written by older releases carry only `sent_count`; the missing cost
//! is back-filled from the rate given at open.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::{GatewayError, GatewayResult};

const RECORD_VERSION: u32 = 1;

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub sent_count: u64,
    pub total_cost: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    #[serde(default)]
    version: u32,
    sent_count: u64,
    #[serde(default)]
    total_cost: Option<f64>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Round to micro-units so repeated additions of a decimal rate stay exact.
fn round_cost(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

pub struct CounterStore {
    path: PathBuf,
    current: RwLock<CounterRecord>,
    writer: Mutex<()>,
}

impl CounterStore {
    /// Open (or create) the record at `path`. `legacy_rate` back-fills the
    /// cost of records that predate cost tracking.
    pub fn open(path: impl AsRef<Path>, legacy_rate: f64) -> GatewayResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                GatewayError::Persistence(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let store = Self {
            path,
            current: RwLock::new(CounterRecord::default()),
            writer: Mutex::new(()),
        };

        match fs::read_to_string(&store.path) {
            Ok(content) => match Self::parse(&content, legacy_rate) {
                Some((record, legacy)) => {
                    *store.current.write().unwrap_or_else(|p| p.into_inner()) = record;
                    if legacy {
                        info!(
                            "Upgrading legacy counter record at {} (back-filled cost {:.2})",
                            store.path.display(),
                            record.total_cost
                        );
                        store.persist(&record)?;
                    }
                    debug!(
                        "Loaded counters from {}: {} sent, cost {:.2}",
                        store.path.display(),
                        record.sent_count,
                        record.total_cost
                    );
                }
                None => {
                    let mut aside = store.path.clone().into_os_string();
                    aside.push(".corrupt");
                    let aside = PathBuf::from(aside);
                    error!(
                        "Counter record {} is corrupt; moved to {} and starting from zero",
                        store.path.display(),
                        aside.display()
                    );
                    if let Err(e) = fs::rename(&store.path, &aside) {
                        warn!("Could not move corrupt counter record aside: {}", e);
                    }
                    store.persist(&CounterRecord::default())?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating counter record at {}", store.path.display());
                store.persist(&CounterRecord::default())?;
            }
            Err(e) => {
                return Err(GatewayError::Persistence(format!(
                    "cannot read {}: {}",
                    store.path.display(),
                    e
                )))
            }
        }
        Ok(store)
    }

    /// Returns the record and whether it came from the legacy layout.
    fn parse(content: &str, legacy_rate: f64) -> Option<(CounterRecord, bool)> {
        let persisted: PersistedRecord = serde_json::from_str(content).ok()?;
        let legacy = persisted.total_cost.is_none();
        let total_cost = persisted
            .total_cost
            .unwrap_or_else(|| round_cost(persisted.sent_count as f64 * legacy_rate.max(0.0)));
        if !total_cost.is_finite() || total_cost < 0.0 {
            return None;
        }
        Some((
            CounterRecord {
                sent_count: persisted.sent_count,
                total_cost,
            },
            legacy,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> CounterRecord {
        *self.current.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Count one more sent message at `cost_per_message`.
    pub fn increment(&self, cost_per_message: f64) -> GatewayResult<CounterRecord> {
        let cost = if cost_per_message.is_finite() && cost_per_message > 0.0 {
            cost_per_message
        } else {
            0.0
        };
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let prev = self.current();
        let next = CounterRecord {
            sent_count: prev.sent_count.saturating_add(1),
            total_cost: round_cost(prev.total_cost + cost),
        };
        self.persist(&next)?;
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = next;
        Ok(next)
    }

    pub fn reset(&self) -> GatewayResult<CounterRecord> {
        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let zero = CounterRecord::default();
        self.persist(&zero)?;
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = zero;
        info!("Counters reset");
        Ok(zero)
    }

    fn persist(&self, record: &CounterRecord) -> GatewayResult<()> {
        let body = serde_json::to_string(&PersistedRecord {
            version: RECORD_VERSION,
            sent_count: record.sent_count,
            total_cost: Some(record.total_cost),
            updated_at: Some(Utc::now()),
        })
        .map_err(|e| GatewayError::Persistence(format!("serialize counters: {}", e)))?;
        write_atomic(&self.path, &body).map_err(|e| {
            GatewayError::Persistence(format!("write {}: {}", self.path.display(), e))
        })
    }
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("counters.json");

    let lock_path = dir.join(format!("{}.lock", base));
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)?;
    lock_file.lock_exclusive()?;

    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                let written = tmp
                    .write_all(content.as_bytes())
                    .and_then(|_| tmp.flush())
                    .and_then(|_| tmp.sync_all());
                if let Err(e) = written {
                    let _ = fs::remove_file(&candidate);
                    return Err(e);
                }
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    // lock released on drop
    drop(lock_file);
    Ok(())
}
