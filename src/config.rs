use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::Facing;
use crate::{Threshold, TrashTypeSet};

const DEFAULT_DB_PATH: &str = "tally.db";
const DEFAULT_STATE_KEY: &str = crate::storage::DEFAULT_STATE_KEY;
const DEFAULT_THRESHOLD_PERCENT: u8 = 50;
const DEFAULT_DEDUP_WINDOW_MS: u64 = 2_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 16;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_ENVIRONMENT_DEVICE: &str = "stub://environment";
const DEFAULT_USER_DEVICE: &str = "stub://user";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_DETECTOR_BACKEND: &str = "scripted";
const DEFAULT_DETECTOR_INPUT_SIZE: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct DashboardConfigFile {
    db_path: Option<String>,
    state_key: Option<String>,
    trash_types: Option<Vec<String>>,
    threshold_percent: Option<u8>,
    dedup_window_ms: Option<u64>,
    tick_interval_ms: Option<u64>,
    render_while_idle: Option<bool>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    remote: Option<RemoteConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    environment_device: Option<String>,
    user_device: Option<String>,
    facing: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub db_path: String,
    pub state_key: String,
    pub trash_types: TrashTypeSet,
    pub threshold: Threshold,
    pub dedup_window: Duration,
    pub tick_interval: Duration,
    pub render_while_idle: bool,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub camera: CameraSettings,
    pub remote_url: Option<String>,
    pub detector: DetectorSettings,
}

/// Devices backing each camera facing mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub environment_device: String,
    pub user_device: String,
    pub facing: Facing,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl CameraSettings {
    pub fn device_for(&self, facing: Facing) -> &str {
        match facing {
            Facing::Environment => &self.environment_device,
            Facing::User => &self.user_device,
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            environment_device: DEFAULT_ENVIRONMENT_DEVICE.to_string(),
            user_device: DEFAULT_USER_DEVICE.to_string(),
            facing: Facing::Environment,
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            target_fps: DEFAULT_CAMERA_FPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            input_size: DEFAULT_DETECTOR_INPUT_SIZE,
        }
    }
}

impl DashboardConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TALLY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DashboardConfigFile) -> Result<Self> {
        let trash_types = match file.trash_types {
            Some(classes) => TrashTypeSet::new(classes)?,
            None => TrashTypeSet::default(),
        };
        let threshold = Threshold::from_percent(
            file.threshold_percent
                .unwrap_or(DEFAULT_THRESHOLD_PERCENT),
        )?;

        let camera_file = file.camera.unwrap_or_default();
        let facing = match camera_file.facing.as_deref() {
            Some(value) => Facing::parse(value)
                .ok_or_else(|| anyhow!("camera.facing must be 'environment' or 'user'"))?,
            None => Facing::Environment,
        };
        let camera = CameraSettings {
            environment_device: camera_file
                .environment_device
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT_DEVICE.to_string()),
            user_device: camera_file
                .user_device
                .unwrap_or_else(|| DEFAULT_USER_DEVICE.to_string()),
            facing,
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector_file.model_path,
            input_size: detector_file
                .input_size
                .unwrap_or(DEFAULT_DETECTOR_INPUT_SIZE),
        };

        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_token_path = file.api.and_then(|api| api.token_path);

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            state_key: file
                .state_key
                .unwrap_or_else(|| DEFAULT_STATE_KEY.to_string()),
            trash_types,
            threshold,
            dedup_window: Duration::from_millis(
                file.dedup_window_ms.unwrap_or(DEFAULT_DEDUP_WINDOW_MS),
            ),
            tick_interval: Duration::from_millis(
                file.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
            render_while_idle: file.render_while_idle.unwrap_or(false),
            api_addr,
            api_token_path,
            camera,
            remote_url: file.remote.and_then(|remote| remote.url),
            detector,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(types) = std::env::var("TALLY_TRASH_TYPES") {
            let parsed = split_csv(&types);
            if !parsed.is_empty() {
                self.trash_types = TrashTypeSet::new(parsed)?;
            }
        }
        if let Ok(threshold) = std::env::var("TALLY_THRESHOLD") {
            let percent: u8 = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("TALLY_THRESHOLD must be an integer percentage (0-100)"))?;
            self.threshold = Threshold::from_percent(percent)?;
        }
        if let Ok(window) = std::env::var("TALLY_DEDUP_WINDOW_MS") {
            let ms: u64 = window.trim().parse().map_err(|_| {
                anyhow!("TALLY_DEDUP_WINDOW_MS must be an integer number of milliseconds")
            })?;
            self.dedup_window = Duration::from_millis(ms);
        }
        if let Ok(addr) = std::env::var("TALLY_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("TALLY_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api_token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(url) = std::env::var("TALLY_REMOTE_URL") {
            if !url.trim().is_empty() {
                self.remote_url = Some(url.trim().to_string());
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.dedup_window.is_zero() {
            return Err(anyhow!("dedup window must be greater than zero"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick interval must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        if self.state_key.trim().is_empty() {
            return Err(anyhow!("state_key must not be empty"));
        }
        if let Some(url) = &self.remote_url {
            if url.trim().is_empty() {
                self.remote_url = None;
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<DashboardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() -> Result<()> {
        let mut cfg = DashboardConfig::from_file(DashboardConfigFile::default())?;
        cfg.validate()?;
        assert_eq!(cfg.db_path, "tally.db");
        assert_eq!(cfg.state_key, "dashState");
        assert_eq!(cfg.trash_types, TrashTypeSet::default());
        assert_eq!(cfg.threshold.percent(), 50);
        assert_eq!(cfg.dedup_window, Duration::from_millis(2000));
        assert_eq!(cfg.tick_interval, Duration::from_millis(16));
        assert!(!cfg.render_while_idle);
        assert_eq!(cfg.camera, CameraSettings::default());
        assert_eq!(cfg.detector, DetectorSettings::default());
        assert!(cfg.remote_url.is_none());
        Ok(())
    }

    #[test]
    fn zero_windows_are_rejected() {
        let file = DashboardConfigFile {
            dedup_window_ms: Some(0),
            ..DashboardConfigFile::default()
        };
        let mut cfg = DashboardConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_above_100_is_rejected() {
        let file = DashboardConfigFile {
            threshold_percent: Some(150),
            ..DashboardConfigFile::default()
        };
        assert!(DashboardConfig::from_file(file).is_err());
    }

    #[test]
    fn device_for_follows_facing() {
        let camera = CameraSettings::default();
        assert_eq!(camera.device_for(Facing::User), "stub://user");
        assert_eq!(camera.device_for(Facing::Environment), "stub://environment");
    }

    #[test]
    fn split_csv_drops_blanks() {
        assert_eq!(split_csv(" bottle, ,cup,"), vec!["bottle", "cup"]);
    }
}
