//! System configuration parameters.
//!
//! All tunable parameters for the switch-box master, grouped the way the
//! supervisory `config.json` lays them out. The file is read once at
//! startup; a broken or missing file falls back to `default_config.json`
//! in the same directory, and finally to the built-in defaults.

use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Core system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub file_config: FileConfig,
    pub can_config: CanConfig,
    pub j1939_config: J1939Config,
    pub pvsw_config: PvswConfig,
    pub alarm_config: AlarmConfig,
    pub seismic_config: SeismicConfig,
}

/// File channel to the supervisory layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding `config.json` and the parameter definition files.
    pub config_path: String,
    /// Directory watched for incoming control command files.
    pub control_path: String,
    /// Directory receiving the rotating system-data files.
    pub data_path: String,
    /// Directory holding the upstream sync script.
    pub script_path: String,
    pub control_name: String,
    pub system_data_name: String,
    /// Records per system-data file before rotating to a new dated file.
    pub system_data_len: usize,
    /// Maximum number of rotated files kept on disk (oldest removed).
    pub system_data_file_num: usize,
    pub script_name: String,
    pub parameter_list_master_name: String,
    /// Common basename of the per-slave-type definition files.
    pub parameter_list_slave_name: String,
}

/// CAN interface parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    pub bitrate: u32,
    pub channel: String,
}

/// J1939 identity used in the address claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct J1939Config {
    pub master_address: u8,
    pub manufacture_code: u16,
    pub identity_number: u32,
}

/// Cycle periods and exchange deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PvswConfig {
    /// Slave refresh + snapshot persistence period (seconds).
    pub master_interval_time: f32,
    /// Control-file poll + alarm evaluation period (seconds).
    pub control_filecheck_interval_time: f32,
    /// Accelerometer burst drain period (seconds).
    pub accel_sensor_interval_time: f32,
    /// Per-exchange reply deadline (milliseconds).
    pub reply_timeout_ms: u32,
}

/// Alarm thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Measured intensity above which the seismic alarm latches.
    pub seismic_threshold: f64,
    /// Moisture voltage above which the water alarm latches.
    pub wet_threshold_volt: f64,
}

/// Seismic estimator window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeismicConfig {
    /// Accelerometer sampling frequency (Hz).
    pub fs: f64,
    /// Window length used for the intensity estimate (seconds).
    pub window_sec: f64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            file_config: FileConfig::default(),
            can_config: CanConfig::default(),
            j1939_config: J1939Config::default(),
            pvsw_config: PvswConfig::default(),
            alarm_config: AlarmConfig::default(),
            seismic_config: SeismicConfig::default(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            config_path: "./Config".into(),
            control_path: "./Control".into(),
            data_path: "./Data".into(),
            script_path: "./Script".into(),
            control_name: "control.json".into(),
            system_data_name: "data.json".into(),
            system_data_len: 1024,
            system_data_file_num: 10,
            script_name: "sync.sh".into(),
            parameter_list_master_name: "parameterListMaster.json".into(),
            parameter_list_slave_name: "parameterListSlave".into(),
        }
    }
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            bitrate: 125_000,
            channel: "can0".into(),
        }
    }
}

impl Default for J1939Config {
    fn default() -> Self {
        Self {
            master_address: 0x01,
            manufacture_code: 0x100,
            identity_number: 0x10,
        }
    }
}

impl Default for PvswConfig {
    fn default() -> Self {
        Self {
            master_interval_time: 5.0,
            control_filecheck_interval_time: 0.25,
            accel_sensor_interval_time: 0.1,
            reply_timeout_ms: 500,
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            seismic_threshold: 4.0,
            wet_threshold_volt: 1.5,
        }
    }
}

impl Default for SeismicConfig {
    fn default() -> Self {
        Self {
            fs: 100.0,
            window_sec: 5.12,
        }
    }
}

impl SystemConfig {
    /// Load configuration from `<config_dir>/config.json`.
    ///
    /// Fallback chain: `config.json` → `default_config.json` → built-in
    /// defaults. Each failed step is logged; the process never refuses to
    /// start over a broken config file.
    pub fn load(config_dir: &Path) -> Self {
        match Self::read_file(&config_dir.join("config.json")) {
            Ok(cfg) => {
                info!("config loaded from config.json");
                cfg
            }
            Err(e) => {
                warn!("config.json unusable ({e}), trying default_config.json");
                match Self::read_file(&config_dir.join("default_config.json")) {
                    Ok(cfg) => {
                        info!("config loaded from default_config.json");
                        cfg
                    }
                    Err(e) => {
                        warn!("default_config.json unusable ({e}), using built-in defaults");
                        Self::default()
                    }
                }
            }
        }
    }

    fn read_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }

    /// Window capacity in samples.
    pub fn window_len(&self) -> usize {
        (self.seismic_config.fs * self.seismic_config.window_sec) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let c = SystemConfig::default();
        assert!(c.pvsw_config.master_interval_time > c.pvsw_config.control_filecheck_interval_time);
        assert!(c.pvsw_config.accel_sensor_interval_time > 0.0);
        assert!(c.seismic_config.fs > 0.0);
        assert!(c.alarm_config.seismic_threshold > 0.0);
        assert_eq!(c.window_len(), 512);
        assert!(c.file_config.system_data_len > 0);
        assert!(c.file_config.system_data_file_num > 0);
    }

    #[test]
    fn serde_roundtrip() {
        let c = SystemConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let c2: SystemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c.j1939_config.master_address, c2.j1939_config.master_address);
        assert_eq!(c.file_config.system_data_len, c2.file_config.system_data_len);
        assert!((c.seismic_config.window_sec - c2.seismic_config.window_sec).abs() < 1e-9);
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        // A sparse config.json must not fail — missing sections default.
        let c: SystemConfig =
            serde_json::from_str(r#"{"can_config": {"channel": "vcan0"}}"#).unwrap();
        assert_eq!(c.can_config.channel, "vcan0");
        assert_eq!(c.can_config.bitrate, 125_000);
        assert_eq!(c.j1939_config.master_address, 0x01);
    }

    #[test]
    fn load_missing_dir_uses_defaults() {
        let c = SystemConfig::load(Path::new("/nonexistent/pvsw"));
        assert_eq!(c.j1939_config.master_address, 0x01);
    }
}
