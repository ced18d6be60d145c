use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persist::write_json_atomic;
use crate::provider::{ProviderConfig, ProviderKey};

use super::clock::Clock;
use super::models::{UsageRecord, UsageStatus};

/// Number of date partitions kept in the usage file.
pub const HISTORY_DAYS: usize = 30;

/// `{ "<YYYY-MM-DD>": { "<provider>_<config>": UsageRecord } }`
pub type UsageHistory = BTreeMap<String, BTreeMap<String, UsageRecord>>;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage file {path} unavailable: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("usage file {path} is corrupt: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
}

pub type UsageResult<T> = std::result::Result<T, UsageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome<'a> {
    Success,
    Failure(&'a str),
}

pub fn read_history(path: &Path) -> UsageResult<UsageHistory> {
    let content = std::fs::read_to_string(path).map_err(|source| UsageError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&content).map_err(|source| UsageError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

pub fn write_history(path: &Path, history: &UsageHistory) -> UsageResult<()> {
    write_json_atomic(path, history).map_err(|source| UsageError::Io {
        source,
        path: path.to_path_buf(),
    })
}

/// `api_usage.json` becomes `api_usage.json.corrupt`.
fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

fn date_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

#[derive(Debug)]
struct LedgerState {
    day: NaiveDate,
    records: BTreeMap<String, UsageRecord>,
}

/// Per-day request and cost accounting, written through on every outcome.
#[derive(Debug)]
pub struct UsageLedger {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl UsageLedger {
    /// Loads today's partition. A missing or unreadable file starts an empty day.
    pub fn load(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let day = clock.today();
        let records = match read_history(&path) {
            Ok(mut history) => history.remove(&date_key(day)).unwrap_or_default(),
            Err(UsageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no usage file yet");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(error = %err, "starting with an empty usage ledger");
                BTreeMap::new()
            }
        };
        Self {
            path,
            clock,
            state: Mutex::new(LedgerState { day, records }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn today(&self) -> NaiveDate {
        self.current().day
    }

    /// Locks the working partition, rolling it over when the day changed.
    fn current(&self) -> MutexGuard<'_, LedgerState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let today = self.clock.today();
        if state.day != today {
            info!(from = %state.day, to = %today, "usage day rolled over");
            state.records = state
                .records
                .iter()
                .map(|(key, record)| (key.clone(), record.rolled_over()))
                .collect();
            state.day = today;
        }
        state
    }

    pub fn ensure(&self, key: &ProviderKey) {
        let mut state = self.current();
        state
            .records
            .entry(key.ledger_key())
            .or_insert_with(|| UsageRecord::new(key));
    }

    pub fn snapshot(&self, key: &ProviderKey) -> Option<UsageRecord> {
        self.current().records.get(&key.ledger_key()).cloned()
    }

    pub fn status(&self, key: &ProviderKey) -> UsageStatus {
        self.snapshot(key)
            .map(|record| record.status)
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.current().records.values().cloned().collect()
    }

    pub fn is_within_quota(&self, config: &ProviderConfig) -> bool {
        let Some(quota) = config.daily_quota else {
            return true;
        };
        let used = self
            .current()
            .records
            .get(&config.key.ledger_key())
            .map(|record| record.requests_today)
            .unwrap_or(0);
        used < quota
    }

    /// Applies a terminal request outcome and persists the ledger.
    pub fn record(&self, config: &ProviderConfig, outcome: UsageOutcome<'_>) -> UsageRecord {
        let now = self.clock.now();
        let mut state = self.current();
        let record = state
            .records
            .entry(config.key.ledger_key())
            .or_insert_with(|| UsageRecord::new(&config.key));
        match outcome {
            UsageOutcome::Success => record.record_success(config.cost_per_request, now),
            UsageOutcome::Failure(error) => {
                record.record_failure(config.cost_per_request, error, now)
            }
        }
        let updated = record.clone();
        self.persist(&state);
        updated
    }

    pub fn mark_quota_exceeded(&self, key: &ProviderKey) {
        let mut state = self.current();
        let record = state
            .records
            .entry(key.ledger_key())
            .or_insert_with(|| UsageRecord::new(key));
        if record.status == UsageStatus::QuotaExceeded {
            return;
        }
        record.status = UsageStatus::QuotaExceeded;
        warn!(provider = %key, requests = record.requests_today, "daily quota reached");
        self.persist(&state);
    }

    pub fn save(&self) {
        let state = self.current();
        self.persist(&state);
    }

    fn persist(&self, state: &LedgerState) {
        let mut history = match read_history(&self.path) {
            Ok(history) => history,
            Err(UsageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                UsageHistory::new()
            }
            Err(err @ UsageError::Parse { .. }) => {
                let aside = corrupt_path(&self.path);
                if let Err(rename_err) = std::fs::rename(&self.path, &aside) {
                    warn!(error = %err, rename_error = %rename_err, "usage history unreadable; not saving");
                    return;
                }
                warn!(error = %err, moved_to = %aside.display(), "set aside corrupt usage history");
                UsageHistory::new()
            }
            Err(err) => {
                warn!(error = %err, "usage history unreadable; not saving");
                return;
            }
        };
        history.insert(date_key(state.day), state.records.clone());
        while history.len() > HISTORY_DAYS {
            history.pop_first();
        }
        if let Err(err) = write_history(&self.path, &history) {
            warn!(error = %err, "failed to save usage ledger");
        }
    }

    pub fn report(&self) -> UsageReport {
        let state = self.current();
        let entries: Vec<UsageRecord> = state.records.values().cloned().collect();
        UsageReport {
            date: date_key(state.day),
            total_requests: entries.iter().map(|entry| entry.requests_today).sum(),
            total_cost: entries.iter().map(|entry| entry.total_cost_today).sum(),
            entries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub date: String,
    pub entries: Vec<UsageRecord>,
    pub total_requests: u64,
    pub total_cost: f64,
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "API usage ({})", self.date)?;
        for entry in &self.entries {
            write!(
                f,
                "  {}/{}: {} requests, ${:.4}, {}",
                entry.provider,
                entry.config_name,
                entry.requests_today,
                entry.total_cost_today,
                entry.status
            )?;
            if let Some(error) = &entry.last_error {
                write!(f, " ({error})")?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "  total: {} requests, ${:.4}",
            self.total_requests, self.total_cost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;
    use crate::usage::FixedClock;
    use chrono::Duration;
    use tempfile::tempdir;

    fn config(quota: Option<u64>, cost: f64) -> ProviderConfig {
        let settings = ProviderSettings {
            api_key: Some("key".into()),
            model_text: Some("model".into()),
            daily_quota: quota,
            cost_per_request: cost,
            ..ProviderSettings::default()
        };
        ProviderConfig::from_settings("gemini", "primary", &settings).unwrap()
    }

    #[test]
    fn quota_is_exhausted_after_successes() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::load(dir.path().join("usage.json"), Arc::new(FixedClock::default()));
        let config = config(Some(2), 0.0);
        assert!(ledger.is_within_quota(&config));
        ledger.record(&config, UsageOutcome::Success);
        assert!(ledger.is_within_quota(&config));
        ledger.record(&config, UsageOutcome::Success);
        assert!(!ledger.is_within_quota(&config));
        assert!(ledger.is_within_quota(&self::config(None, 0.0)));
    }

    #[test]
    fn record_is_written_through_and_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let clock = Arc::new(FixedClock::default());
        let config = config(None, 0.25);
        {
            let ledger = UsageLedger::load(&path, clock.clone());
            ledger.record(&config, UsageOutcome::Failure("HTTP 503"));
            ledger.record(&config, UsageOutcome::Success);
        }
        let reloaded = UsageLedger::load(&path, clock);
        let record = reloaded.snapshot(&config.key).unwrap();
        assert_eq!(record.requests_today, 2);
        assert_eq!(record.status, UsageStatus::Active);
        assert!((record.total_cost_today - 0.5).abs() < 1e-12);

        let history = read_history(&path).unwrap();
        assert!(history["2025-01-15"].contains_key("gemini_primary"));
    }

    #[test]
    fn tiny_costs_survive_a_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let key = ProviderKey::new("openai", "default");
        let mut record = UsageRecord::new(&key);
        let now = chrono::Utc::now();
        for _ in 0..10_000 {
            record.record_success(0.0001, now);
        }
        let mut history = UsageHistory::new();
        history.insert(
            "2025-01-15".into(),
            BTreeMap::from([(key.ledger_key(), record.clone())]),
        );
        write_history(&path, &history).unwrap();

        let loaded = read_history(&path).unwrap();
        let restored = &loaded["2025-01-15"]["openai_default"];
        assert_eq!(restored, &record);
        assert_eq!(restored.requests_today, 10_000);
        assert!((restored.total_cost_today - 1.0).abs() < 1e-9);
    }

    #[test]
    fn history_is_pruned_to_most_recent_days() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let key = ProviderKey::new("gemini", "primary");
        let start = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        let history: UsageHistory = (0..35)
            .map(|offset| {
                let day = start + Duration::days(offset);
                (
                    date_key(day),
                    BTreeMap::from([(key.ledger_key(), UsageRecord::new(&key))]),
                )
            })
            .collect();
        write_history(&path, &history).unwrap();

        let clock = Arc::new(FixedClock::at_date(2025, 1, 15));
        let ledger = UsageLedger::load(&path, clock);
        ledger.record(&config(None, 0.0), UsageOutcome::Success);

        let saved = read_history(&path).unwrap();
        assert_eq!(saved.len(), HISTORY_DAYS);
        let keys: Vec<_> = saved.keys().cloned().collect();
        assert_eq!(keys.first().map(String::as_str), Some("2024-12-07"));
        assert_eq!(keys.last().map(String::as_str), Some("2025-01-15"));
    }

    #[test]
    fn day_rollover_resets_counters() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(FixedClock::default());
        let ledger = UsageLedger::load(dir.path().join("usage.json"), clock.clone());
        let config = config(Some(1), 1.0);
        ledger.record(&config, UsageOutcome::Failure("quota exceeded for today"));
        assert_eq!(ledger.status(&config.key), UsageStatus::QuotaExceeded);
        assert!(!ledger.is_within_quota(&config));

        clock.advance(Duration::days(1));
        let record = ledger.snapshot(&config.key).unwrap();
        assert_eq!(record.requests_today, 0);
        assert_eq!(record.status, UsageStatus::Active);
        assert!(ledger.is_within_quota(&config));
    }

    #[test]
    fn corrupt_or_unwritable_files_are_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(&path, "{ not json").unwrap();
        let ledger = UsageLedger::load(&path, Arc::new(FixedClock::default()));
        assert!(ledger.records().is_empty());
        ledger.record(&config(None, 0.0), UsageOutcome::Success);
        assert_eq!(read_history(&path).unwrap().len(), 1);
        let aside = dir.path().join("usage.json.corrupt");
        assert_eq!(std::fs::read_to_string(aside).unwrap(), "{ not json");

        let blocked = dir.path().join("as_dir");
        std::fs::create_dir(&blocked).unwrap();
        let ledger = UsageLedger::load(&blocked, Arc::new(FixedClock::default()));
        let record = ledger.record(&config(None, 0.0), UsageOutcome::Success);
        assert_eq!(record.requests_today, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_on_one_pair_are_not_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let ledger = Arc::new(UsageLedger::load(&path, Arc::new(FixedClock::default())));
        let config = Arc::new(config(None, 0.5));

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        let outcome = if worker % 2 == 0 {
                            UsageOutcome::Success
                        } else {
                            UsageOutcome::Failure("HTTP 503")
                        };
                        ledger.record(&config, outcome);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let record = ledger.snapshot(&config.key).unwrap();
        assert_eq!(record.requests_today, 200);
        assert!((record.total_cost_today - 100.0).abs() < 1e-9);
        let persisted = &read_history(&path).unwrap()["2025-01-15"]["gemini_primary"];
        assert_eq!(persisted.requests_today, 200);
        assert!((persisted.total_cost_today - 100.0).abs() < 1e-9);
    }

    #[test]
    fn report_totals_all_pairs() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::load(dir.path().join("usage.json"), Arc::new(FixedClock::default()));
        ledger.record(&config(None, 0.5), UsageOutcome::Success);
        ledger.record(&config(None, 0.5), UsageOutcome::Failure("boom"));
        let report = ledger.report();
        assert_eq!(report.total_requests, 2);
        assert!((report.total_cost - 1.0).abs() < 1e-12);
        let text = report.to_string();
        assert!(text.contains("gemini/primary: 2 requests"));
        assert!(text.contains("(boom)"));
    }
}
