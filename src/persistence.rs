// =============================================================================
// State persistence — atomic JSON snapshots for OB state, positions, orders
// =============================================================================
//
// Builds on the tmp-then-rename pattern used for runtime configuration, with
// two additions the full trading state needs: an fsync before rename (so a
// crash between write and rename can never leave a half-flushed file) and
// corrupt-file quarantine on load (a failed parse backs the file up under a
// timestamped `.corrupt.<ts>` suffix instead of losing it silently).
// =============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::errors::{EngineError, EngineResult};

pub struct StatePersistence {
    data_dir: PathBuf,
}

impl StatePersistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .map_err(|e| EngineError::StateCorruption(format!("cannot create data dir: {e}")))?;
        info!(dir = %data_dir.display(), "state persistence initialized");
        Ok(Self { data_dir })
    }

    fn path_for(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    /// Writes `value` as pretty JSON to `filename` using write-temp,
    /// fsync, rename. The temp file lives alongside the target so the
    /// final rename stays on the same filesystem and is atomic.
    pub fn atomic_write<T: Serialize>(&self, filename: &str, value: &T) -> EngineResult<()> {
        let target = self.path_for(filename);
        let tmp_path = self.data_dir.join(format!(".{filename}.tmp"));

        let json = serde_json::to_string_pretty(value)
            .map_err(|e| EngineError::StateCorruption(format!("failed to serialize {filename}: {e}")))?;

        let write_result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(EngineError::StateCorruption(format!(
                "failed to write {}: {e}",
                tmp_path.display()
            )));
        }

        fs::rename(&tmp_path, &target)
            .map_err(|e| EngineError::StateCorruption(format!("failed to rename into {}: {e}", target.display())))?;

        debug!(file = %target.display(), "state snapshot written atomically");
        Ok(())
    }

    /// Loads and parses `filename`. Returns `Ok(None)` if the file does not
    /// exist. On a parse failure, quarantines the corrupt file under a
    /// `.corrupt.<timestamp>` suffix and returns `Ok(None)` rather than
    /// propagating the error, so the caller can fall back to fresh state.
    pub fn safe_load<T: DeserializeOwned>(&self, filename: &str) -> EngineResult<Option<T>> {
        let path = self.path_for(filename);
        if !path.exists() {
            debug!(file = %path.display(), "no existing state file");
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| EngineError::StateCorruption(format!("failed to read {}: {e}", path.display())))?;

        match serde_json::from_str::<T>(&content) {
            Ok(value) => {
                debug!(file = %path.display(), "loaded state");
                Ok(Some(value))
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "corrupt state file");
                self.quarantine(&path)?;
                Ok(None)
            }
        }
    }

    fn quarantine(&self, path: &Path) -> EngineResult<()> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup = path.with_extension(format!("corrupt.{timestamp}"));
        fs::copy(path, &backup)
            .map_err(|e| EngineError::StateCorruption(format!("failed to quarantine {}: {e}", path.display())))?;
        warn!(original = %path.display(), backup = %backup.display(), "quarantined corrupt state file");
        Ok(())
    }

    pub fn ob_state_filename(symbol_scope: &str) -> String {
        format!("ob_state_{symbol_scope}.json")
    }

    pub fn positions_filename(account: &str) -> String {
        format!("positions_{account}.json")
    }

    pub fn orders_filename(account: &str) -> String {
        format!("orders_{account}.json")
    }

    pub fn capital_filename() -> String {
        "capital.json".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u64,
    }

    #[test]
    fn round_trips_through_atomic_write_and_safe_load() {
        let dir = std::env::temp_dir().join(format!("smc_persist_test_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let persistence = StatePersistence::new(&dir).unwrap();

        persistence.atomic_write("sample.json", &Sample { value: 42 }).unwrap();
        let loaded: Option<Sample> = persistence.safe_load("sample.json").unwrap();
        assert_eq!(loaded, Some(Sample { value: 42 }));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_returns_none_without_error() {
        let dir = std::env::temp_dir().join(format!("smc_persist_missing_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let persistence = StatePersistence::new(&dir).unwrap();
        let loaded: Option<Sample> = persistence.safe_load("nope.json").unwrap();
        assert_eq!(loaded, None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_is_quarantined_and_load_returns_none() {
        let dir = std::env::temp_dir().join(format!("smc_persist_corrupt_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let persistence = StatePersistence::new(&dir).unwrap();

        fs::write(dir.join("bad.json"), b"{not valid json").unwrap();
        let loaded: Option<Sample> = persistence.safe_load("bad.json").unwrap();
        assert_eq!(loaded, None);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert!(entries.iter().any(|e| e.file_name().to_string_lossy().contains("corrupt")));

        fs::remove_dir_all(&dir).ok();
    }
}
