//! Filesystem adapter for the supervisory channel.
//!
//! System-data snapshots append into dated JSON files
//! (`YYYYmmddHHMMSS_<name>`) under the data directory, keyed
//! `master_data_<index>`; a full file rotates to a fresh one and the
//! oldest file is pruned once the count cap is exceeded. Control command
//! files arrive in the control directory and are deduplicated by
//! modification time, so an unchanged file is consumed exactly once.
//! Either direction is synchronised upstream by a site-provided bash
//! script, fired and forgotten.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::SystemTime;

use chrono::Local;
use log::{info, warn};
use serde_json::{Map, Value};

use crate::config::FileConfig;
use crate::error::FileError;
use crate::master::ports::FilePort;

/// First script argument: direction of the upstream sync.
const SYNC_UPLOAD: &str = "-U";
const SYNC_DOWNLOAD: &str = "-D";

pub struct FileStore {
    config: FileConfig,
    last_control_mtime: Option<SystemTime>,
}

impl FileStore {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            last_control_mtime: None,
        }
    }

    /// Files in `dir` whose name contains `stem`, sorted by name. The
    /// dated prefix makes name order equal age order.
    fn matching_files(dir: &Path, stem: &str) -> Result<Vec<PathBuf>, FileError> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().contains(stem) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Path for the next rotated data file. The stamp skips forward past
    /// any name already on disk, so a rotation within the same second
    /// never hands back the full file it is rotating away from.
    fn dated_data_file(&self) -> PathBuf {
        let mut stamp = Local::now();
        loop {
            let name = format!(
                "{}_{}",
                stamp.format("%Y%m%d%H%M%S"),
                self.config.system_data_name
            );
            let path = Path::new(&self.config.data_path).join(name);
            if !path.exists() {
                return path;
            }
            stamp += chrono::Duration::seconds(1);
        }
    }

    /// Load a data file's record object, clearing it when undecodable.
    fn read_records(path: &Path) -> Result<Map<String, Value>, FileError> {
        if !path.exists() {
            return Ok(Map::new());
        }
        let text = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => {
                warn!("{} undecodable, starting over", path.display());
                Ok(Map::new())
            }
        }
    }

    /// Launch the upstream sync script without waiting on it.
    fn run_sync_script(&self, direction: &str, local_dir: &str, server_dir: &str) {
        let script = Path::new(&self.config.script_path).join(&self.config.script_name);
        let spawned = Command::new("bash")
            .arg(&script)
            .arg(direction)
            .arg(format!("{local_dir}/"))
            .arg(format!("{server_dir}/"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!("sync script {} failed to start: {e}", script.display());
        }
    }
}

impl FilePort for FileStore {
    fn save_snapshot(&mut self, snapshot: &Value) -> Result<(), FileError> {
        std::fs::create_dir_all(&self.config.data_path)?;
        let mut files =
            Self::matching_files(Path::new(&self.config.data_path), &self.config.system_data_name)?;

        let mut path = match files.last() {
            Some(newest) => newest.clone(),
            None => self.dated_data_file(),
        };
        let mut records = Self::read_records(&path)?;
        if records.len() >= self.config.system_data_len {
            path = self.dated_data_file();
            records = Map::new();
            files.push(path.clone());
            info!("system data rotated to {}", path.display());
        }

        let key = format!("master_data_{:08x}", records.len());
        records.insert(key, snapshot.clone());
        std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(records))?)?;

        while files.len() > self.config.system_data_file_num {
            let oldest = files.remove(0);
            info!("pruning {}", oldest.display());
            std::fs::remove_file(&oldest)?;
        }

        self.run_sync_script(SYNC_UPLOAD, &self.config.data_path, "Data");
        Ok(())
    }

    fn poll_control(&mut self) -> Result<Option<Value>, FileError> {
        self.run_sync_script(SYNC_DOWNLOAD, &self.config.control_path, "Control");
        let dir = Path::new(&self.config.control_path);
        if !dir.is_dir() {
            return Ok(None);
        }
        let files = Self::matching_files(dir, &self.config.control_name)?;
        let Some(newest) = files.last() else {
            return Ok(None);
        };

        let mtime = std::fs::metadata(newest)?.modified()?;
        if self.last_control_mtime == Some(mtime) {
            return Ok(None);
        }
        // Mark consumed before parsing, so a broken file is not retried
        // every cycle.
        self.last_control_mtime = Some(mtime);

        let text = std::fs::read_to_string(newest)?;
        match serde_json::from_str(&text) {
            Ok(value) => {
                info!("loaded {}", newest.display());
                Ok(Some(value))
            }
            Err(_) => Err(FileError::MalformedCommandFile),
        }
    }

    fn refresh_config(&mut self) {
        self.run_sync_script(SYNC_DOWNLOAD, &self.config.config_path, "Config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path) -> FileStore {
        let mut config = FileConfig::default();
        config.data_path = dir.join("data").to_string_lossy().into_owned();
        config.control_path = dir.join("control").to_string_lossy().into_owned();
        // Nonexistent script: the spawn failure is logged, not fatal.
        config.script_path = dir.join("script").to_string_lossy().into_owned();
        config.system_data_len = 3;
        config.system_data_file_num = 2;
        FileStore::new(config)
    }

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pvsw-files-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn snapshots_append_with_indexed_keys() {
        let dir = tempdir("append");
        let mut s = store(&dir);
        s.save_snapshot(&json!({"scale": 0.0})).unwrap();
        s.save_snapshot(&json!({"scale": 1.0})).unwrap();

        let files = FileStore::matching_files(Path::new(&s.config.data_path), "data.json").unwrap();
        assert_eq!(files.len(), 1);
        let records = FileStore::read_records(&files[0]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records["master_data_00000000"]["scale"], json!(0.0));
        assert_eq!(records["master_data_00000001"]["scale"], json!(1.0));
    }

    #[test]
    fn full_file_rotates_and_old_files_are_pruned() {
        let dir = tempdir("rotate");
        let mut s = store(&dir);
        // 3 records per file, 2 files kept: 9 saves forces a prune.
        for i in 0..9 {
            s.save_snapshot(&json!({ "n": i })).unwrap();
        }
        let files = FileStore::matching_files(Path::new(&s.config.data_path), "data.json").unwrap();
        assert_eq!(files.len(), 2);
        let newest = FileStore::read_records(files.last().unwrap()).unwrap();
        assert_eq!(newest["master_data_00000002"]["n"], json!(8));
    }

    #[test]
    fn same_second_rotation_never_overwrites_the_full_file() {
        let dir = tempdir("samesec");
        let mut s = store(&dir);
        // All four saves land within one wall-clock second; the fourth
        // rotates and must not reuse the full file's name.
        for i in 0..4 {
            s.save_snapshot(&json!({ "n": i })).unwrap();
        }
        let files = FileStore::matching_files(Path::new(&s.config.data_path), "data.json").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(FileStore::read_records(&files[0]).unwrap().len(), 3);
        assert_eq!(FileStore::read_records(&files[1]).unwrap().len(), 1);
    }

    #[test]
    fn control_file_consumed_once_per_mtime() {
        let dir = tempdir("control");
        let mut s = store(&dir);
        std::fs::create_dir_all(&s.config.control_path).unwrap();
        let path = Path::new(&s.config.control_path).join("20260101000000_control.json");
        std::fs::write(&path, r#"{"master": {"alarm_reset": 1}}"#).unwrap();

        let first = s.poll_control().unwrap();
        assert!(first.is_some());
        assert_eq!(s.poll_control().unwrap(), None, "same mtime is ignored");
    }

    #[test]
    fn missing_control_dir_is_not_an_error() {
        let dir = tempdir("nodir");
        let mut s = store(&dir);
        assert_eq!(s.poll_control().unwrap(), None);
    }

    #[test]
    fn malformed_control_file_errors_once() {
        let dir = tempdir("badctl");
        let mut s = store(&dir);
        std::fs::create_dir_all(&s.config.control_path).unwrap();
        let path = Path::new(&s.config.control_path).join("20260101000000_control.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(
            s.poll_control().unwrap_err(),
            FileError::MalformedCommandFile
        );
        assert_eq!(s.poll_control().unwrap(), None, "broken file is not retried");
    }
}
