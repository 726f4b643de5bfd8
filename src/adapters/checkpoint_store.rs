//! File-backed checkpoint store.
//!
//! One `checkpoints.json` index per storage directory, keyed by date
//! range, each key holding the sorted de-duplicated ids already evaluated
//! for that range. Every finished run's summary lives next to it in its
//! own `{id}_{range}.json` file, and a per-range session file records the
//! ids this invocation produced. Writes go to a temp file first and are
//! renamed into place, and all writers serialize on one lock, so
//! concurrent sweep workers cannot interleave partial JSON.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::domain::backtest::BacktestSummary;
use crate::domain::error::TradeLoopError;
use crate::domain::sweep::BacktestDateRange;
use crate::ports::checkpoint_port::{CheckpointLookup, CheckpointMode, CheckpointPort};

/// Range key to evaluated strategy ids, sorted and unique.
type CheckpointIndex = HashMap<String, Vec<String>>;

pub struct CheckpointStore {
    dir: PathBuf,
    mode: CheckpointMode,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, mode: CheckpointMode) -> Result<Self, TradeLoopError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot create checkpoint dir {}: {e}", dir.display()),
        })?;
        Ok(CheckpointStore {
            dir,
            mode,
            write_lock: Mutex::new(()),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("checkpoints.json")
    }

    fn result_path(&self, strategy_id: &str, range: &BacktestDateRange) -> PathBuf {
        self.dir.join(format!("{strategy_id}_{}.json", range.key()))
    }

    fn session_path(&self, range: &BacktestDateRange) -> PathBuf {
        self.dir.join(format!("{}.session.json", range.key()))
    }

    fn read<T: DeserializeOwned + Default>(path: &Path) -> Result<T, TradeLoopError> {
        if !path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(path).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&content).map_err(|e| TradeLoopError::Storage {
            reason: format!("corrupt checkpoint file {}: {e}", path.display()),
        })
    }

    fn write<T: Serialize>(path: &Path, value: &T) -> Result<(), TradeLoopError> {
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot serialize checkpoint: {e}"),
        })?;
        fs::write(&tmp, content).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot write {}: {e}", tmp.display()),
        })?;
        fs::rename(&tmp, path).map_err(|e| TradeLoopError::Storage {
            reason: format!("cannot move {} into place: {e}", tmp.display()),
        })?;
        Ok(())
    }
}

impl CheckpointPort for CheckpointStore {
    fn get_checkpoints(
        &self,
        strategy_ids: &[String],
        range: &BacktestDateRange,
    ) -> Result<CheckpointLookup, TradeLoopError> {
        let index: CheckpointIndex = Self::read(&self.index_path())?;
        let evaluated = index.get(&range.key()).cloned().unwrap_or_default();
        let mut lookup = CheckpointLookup::default();
        for id in strategy_ids {
            if !evaluated.contains(id) {
                lookup.missing.push(id.clone());
                continue;
            }
            let path = self.result_path(id, range);
            if !path.exists() {
                // Index entry without its result: recompute rather than fail.
                warn!(
                    strategy = id.as_str(),
                    range = range.key().as_str(),
                    "checkpointed result file is gone, re-running"
                );
                lookup.missing.push(id.clone());
                continue;
            }
            let summary: Option<BacktestSummary> = Self::read(&path)?;
            match summary {
                Some(summary) => {
                    lookup.checkpointed.push(id.clone());
                    lookup.results.push(summary);
                }
                None => lookup.missing.push(id.clone()),
            }
        }
        Ok(lookup)
    }

    fn stash_partial(
        &self,
        range: &BacktestDateRange,
        summary: &BacktestSummary,
    ) -> Result<(), TradeLoopError> {
        let _guard = self.write_lock.lock().map_err(|_| TradeLoopError::Storage {
            reason: "checkpoint write lock poisoned".into(),
        })?;
        Self::write(
            &self.result_path(&summary.strategy_id, range),
            &Some(summary.clone()),
        )?;
        let path = self.session_path(range);
        let mut session: Vec<String> = Self::read(&path)?;
        if !session.contains(&summary.strategy_id) {
            session.push(summary.strategy_id.clone());
            session.sort();
        }
        Self::write(&path, &session)
    }

    fn create_checkpoint(
        &self,
        range: &BacktestDateRange,
        results: &[BacktestSummary],
    ) -> Result<(), TradeLoopError> {
        let _guard = self.write_lock.lock().map_err(|_| TradeLoopError::Storage {
            reason: "checkpoint write lock poisoned".into(),
        })?;
        for summary in results {
            Self::write(
                &self.result_path(&summary.strategy_id, range),
                &Some(summary.clone()),
            )?;
        }

        let path = self.index_path();
        let mut index: CheckpointIndex = Self::read(&path)?;
        let mut ids: Vec<String> = results.iter().map(|s| s.strategy_id.clone()).collect();
        if self.mode == CheckpointMode::Append {
            if let Some(existing) = index.get(&range.key()) {
                ids.extend(existing.iter().cloned());
            }
        }
        ids.sort();
        ids.dedup();
        // Other range keys are carried over untouched.
        index.insert(range.key(), ids);
        Self::write(&path, &index)?;

        let session = self.session_path(range);
        if session.exists() {
            fs::remove_file(&session).map_err(|e| TradeLoopError::Storage {
                reason: format!("cannot remove session cache {}: {e}", session.display()),
            })?;
        }
        debug!(
            range = range.key().as_str(),
            results = results.len(),
            "checkpoint written"
        );
        Ok(())
    }
}
