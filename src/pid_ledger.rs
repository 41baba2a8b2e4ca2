use crate::error::FileError;
use crate::file::{read_optional, with_file_lock, write_atomic};
use crate::procs;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

pub type PidMap = BTreeMap<String, PidRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    /// RFC 3339 UTC, kept as text so a hand-edited value never fails a load
    pub started: String,
}

impl PidRecord {
    pub fn new(pid: u32, started: DateTime<Utc>) -> Self {
        Self {
            pid,
            started: started.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.started)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    pids: PidMap,
}

/// Durable record of which tunnels have a live ssh process.
#[derive(Debug, Clone)]
pub struct PidLedger {
    path: PathBuf,
}

impl PidLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the live entries. Dead ones are dropped from the result and the
    /// pruned map is written back on a background thread.
    pub fn load(&self) -> Result<PidMap, FileError> {
        let Some(raw) = self.with_lock(|| read_optional(&self.path))? else {
            return Ok(PidMap::new());
        };
        let file: LedgerFile = match toml::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!("Error parsing pid ledger {}: {}", self.path.display(), e);
                return Ok(PidMap::new());
            }
        };
        let (alive, dead): (PidMap, PidMap) = file
            .pids
            .into_iter()
            .partition(|(_, record)| procs::is_alive(record.pid));
        if !dead.is_empty() {
            debug!(
                "pruning dead ledger entries: {}",
                dead.keys().cloned().collect::<Vec<_>>().join(", ")
            );
            self.prune_in_background(raw, alive.clone());
        }
        Ok(alive)
    }

    /// Replaces the ledger wholesale. An empty map removes the file.
    pub fn save(&self, pids: &PidMap) -> Result<(), FileError> {
        self.with_lock(|| self.save_unlocked(pids))
    }

    fn save_unlocked(&self, pids: &PidMap) -> Result<(), FileError> {
        if pids.is_empty() {
            return match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(FileError::WriteError {
                    path: self.path.clone(),
                    details: Some(e.to_string()),
                }),
                _ => Ok(()),
            };
        }
        let file = LedgerFile { pids: pids.clone() };
        let raw = toml::to_string(&file).map_err(|e| FileError::SerializeError {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &raw)
    }

    fn prune_in_background(&self, seen: String, pruned: PidMap) {
        let ledger = self.clone();
        std::thread::spawn(move || {
            let result = ledger.with_lock(|| {
                // someone rewrote the ledger since we read it; theirs wins
                if read_optional(&ledger.path)?.as_deref() != Some(seen.as_str()) {
                    return Ok(());
                }
                ledger.save_unlocked(&pruned)
            });
            if let Err(err) = result {
                warn!("failed to prune pid ledger: {err}");
            }
        });
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T, FileError>) -> Result<T, FileError> {
        with_file_lock(&self.path, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        child.id()
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = PidLedger::new(dir.path().join("pids.toml"));
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_empty_removes_file() {
        let dir = TempDir::new().unwrap();
        let ledger = PidLedger::new(dir.path().join("pids.toml"));
        let mut child = sleeper();
        let mut pids = PidMap::new();
        pids.insert("web".into(), PidRecord::new(child.id(), Utc::now()));
        ledger.save(&pids).unwrap();
        assert!(ledger.path().exists());

        ledger.save(&PidMap::new()).unwrap();
        assert!(!ledger.path().exists());
        // removing a file that is already gone is fine
        ledger.save(&PidMap::new()).unwrap();

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_round_trip_with_live_processes_is_stable() {
        let dir = TempDir::new().unwrap();
        let ledger = PidLedger::new(dir.path().join("pids.toml"));
        let mut a = sleeper();
        let mut b = sleeper();
        let mut pids = PidMap::new();
        pids.insert("a".into(), PidRecord::new(a.id(), Utc::now()));
        pids.insert("b".into(), PidRecord::new(b.id(), Utc::now()));
        ledger.save(&pids).unwrap();
        let before = std::fs::read_to_string(ledger.path()).unwrap();

        let loaded = ledger.load().unwrap();
        assert_eq!(loaded, pids);
        ledger.save(&loaded).unwrap();
        assert_eq!(std::fs::read_to_string(ledger.path()).unwrap(), before);

        for child in [&mut a, &mut b] {
            child.kill().unwrap();
            child.wait().unwrap();
        }
    }

    #[test]
    fn test_load_prunes_dead_entries() {
        let dir = TempDir::new().unwrap();
        let ledger = PidLedger::new(dir.path().join("pids.toml"));
        let mut alive = sleeper();
        let mut pids = PidMap::new();
        pids.insert("alive".into(), PidRecord::new(alive.id(), Utc::now()));
        pids.insert("dead".into(), PidRecord::new(dead_pid(), Utc::now()));
        ledger.save(&pids).unwrap();

        let loaded = ledger.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("alive"));

        // the pruned map lands on disk shortly after
        let mut on_disk = 2;
        for _ in 0..50 {
            let raw = std::fs::read_to_string(ledger.path()).unwrap();
            let file: LedgerFile = toml::from_str(&raw).unwrap();
            on_disk = file.pids.len();
            if on_disk == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(on_disk, 1);

        alive.kill().unwrap();
        alive.wait().unwrap();
    }

    #[test]
    fn test_unparseable_ledger_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pids.toml");
        std::fs::write(&path, "pids = [not toml").unwrap();
        assert!(PidLedger::new(&path).load().unwrap().is_empty());
    }

    #[test]
    fn test_pid_record_started_at() {
        let now = Utc::now();
        let record = PidRecord::new(42, now);
        assert!(record.started.ends_with('Z'));
        assert_eq!(record.started_at().unwrap().timestamp(), now.timestamp());

        let record = PidRecord {
            pid: 42,
            started: "yesterday".to_string(),
        };
        assert!(record.started_at().is_none());
    }
}
