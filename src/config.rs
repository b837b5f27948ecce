use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::detect::InferenceParams;
use crate::error::{PresenceError, Result};
use crate::presence::{TrackerSettings, DEFAULT_IOU_SAME, DEFAULT_KEEPALIVE_S};
use crate::snapshot::DEFAULT_SNAP_EVERY_S;

const DEFAULT_SNAPSHOT_DIR: &str = "data/snapshots";
const DEFAULT_STATIC_MOUNT: &str = "/static";
const DEFAULT_DB_PATH: &str = "data/app.db";
const DEFAULT_CAMERA_ID: &str = "cam01";
const DEFAULT_SOURCE: &str = "stub://front_camera";
const DEFAULT_IMGSZ: u32 = 640;
const DEFAULT_CONF: f32 = 0.45;
const DEFAULT_STRIDE: u32 = 1;
const DEFAULT_MAX_FPS: f64 = 15.0;
const DEFAULT_MODEL: &str = "yolov8n.pt";
const DEFAULT_DEVICE: &str = "cuda";

#[derive(Debug, Deserialize, Default)]
struct PresenceConfigFile {
    paths: Option<PathsConfigFile>,
    camera: Option<CameraConfigFile>,
    yolo: Option<ModelConfigFile>,
    tracker: Option<TrackerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PathsConfigFile {
    snapshot_dir: Option<PathBuf>,
    static_mount: Option<String>,
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    id: Option<String>,
    source: Option<SourceValue>,
    imgsz: Option<u32>,
    conf: Option<f32>,
    stride: Option<u32>,
    snap_every_s: Option<f64>,
    max_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    model: Option<String>,
    device: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    iou_same: Option<f64>,
    keepalive_s: Option<f64>,
}

/// Camera sources are written either as a device index (`0`) or a descriptor string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SourceValue {
    Index(u32),
    Descriptor(String),
}

impl SourceValue {
    pub fn into_descriptor(self) -> String {
        match self {
            SourceValue::Index(i) => i.to_string(),
            SourceValue::Descriptor(s) => s,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub camera_id: String,
    pub paths: PathSettings,
    pub service: ServiceConfig,
    pub tracker: TrackerSettings,
}

#[derive(Debug, Clone)]
pub struct PathSettings {
    pub snapshot_dir: PathBuf,
    /// URL prefix snapshot paths are served under.
    pub static_mount: String,
    pub db_path: String,
}

/// The mutable part of the configuration, owned by `DetectorService`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub camera: CameraSettings,
    pub model: ModelSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSettings {
    pub source: String,
    pub imgsz: u32,
    pub conf: f32,
    pub stride: u32,
    pub snap_every_s: f64,
    pub max_fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSettings {
    pub model: String,
    pub device: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            imgsz: DEFAULT_IMGSZ,
            conf: DEFAULT_CONF,
            stride: DEFAULT_STRIDE,
            snap_every_s: DEFAULT_SNAP_EVERY_S,
            max_fps: DEFAULT_MAX_FPS,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            device: DEFAULT_DEVICE.to_string(),
        }
    }
}

impl CameraSettings {
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(invalid("camera.source must not be empty"));
        }
        if self.imgsz == 0 {
            return Err(invalid("camera.imgsz must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(invalid("camera.conf must be within [0, 1]"));
        }
        if self.stride == 0 {
            return Err(invalid("camera.stride must be at least 1"));
        }
        if !(self.snap_every_s >= 0.0) {
            return Err(invalid("camera.snap_every_s must not be negative"));
        }
        if !(self.max_fps > 0.0) {
            return Err(invalid("camera.max_fps must be greater than zero"));
        }
        Ok(())
    }
}

impl ModelSettings {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(invalid("yolo.model must not be empty"));
        }
        if self.device.trim().is_empty() {
            return Err(invalid("yolo.device must not be empty"));
        }
        Ok(())
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        self.model.validate()
    }

    /// Per-call inference parameters handed to the detection adapter.
    pub fn inference_params(&self) -> InferenceParams {
        InferenceParams {
            imgsz: self.camera.imgsz,
            conf: self.camera.conf,
            device: self.model.device.clone(),
        }
    }
}

fn invalid(msg: &str) -> PresenceError {
    PresenceError::InvalidParams(msg.to_string())
}

impl PresenceConfig {
    /// Load from the file named by `PRESENCE_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("PRESENCE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (or defaults), then env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PresenceConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PresenceConfigFile) -> Self {
        let paths = file.paths.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let yolo = file.yolo.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        Self {
            camera_id: camera
                .id
                .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
            paths: PathSettings {
                snapshot_dir: paths
                    .snapshot_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
                static_mount: paths
                    .static_mount
                    .unwrap_or_else(|| DEFAULT_STATIC_MOUNT.to_string()),
                db_path: paths
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            },
            service: ServiceConfig {
                camera: CameraSettings {
                    source: camera
                        .source
                        .map(SourceValue::into_descriptor)
                        .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                    imgsz: camera.imgsz.unwrap_or(DEFAULT_IMGSZ),
                    conf: camera.conf.unwrap_or(DEFAULT_CONF),
                    stride: camera.stride.unwrap_or(DEFAULT_STRIDE),
                    snap_every_s: camera.snap_every_s.unwrap_or(DEFAULT_SNAP_EVERY_S),
                    max_fps: camera.max_fps.unwrap_or(DEFAULT_MAX_FPS),
                },
                model: ModelSettings {
                    model: yolo.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                    device: yolo.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                },
            },
            tracker: TrackerSettings {
                iou_same: tracker.iou_same.unwrap_or(DEFAULT_IOU_SAME),
                keepalive_s: tracker.keepalive_s.unwrap_or(DEFAULT_KEEPALIVE_S),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(id) = env_nonempty("PRESENCE_CAMERA_ID") {
            self.camera_id = id;
        }
        if let Some(source) = env_nonempty("PRESENCE_SOURCE") {
            self.service.camera.source = source;
        }
        if let Some(dir) = env_nonempty("PRESENCE_SNAPSHOT_DIR") {
            self.paths.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(db) = env_nonempty("PRESENCE_DB_PATH") {
            self.paths.db_path = db;
        }
        if let Some(device) = env_nonempty("PRESENCE_DEVICE") {
            self.service.model.device = device;
        }
        if let Some(stride) = env_nonempty("PRESENCE_STRIDE") {
            self.service.camera.stride = stride.parse().map_err(|_| {
                PresenceError::Config("PRESENCE_STRIDE must be a positive integer".to_string())
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera_id = validate_camera_id(&self.camera_id)?;
        self.service
            .validate()
            .map_err(|e| PresenceError::Config(e.to_string()))?;
        if !(self.tracker.iou_same > 0.0 && self.tracker.iou_same <= 1.0) {
            return Err(PresenceError::Config(
                "tracker.iou_same must be within (0, 1]".to_string(),
            ));
        }
        if !(self.tracker.keepalive_s > 0.0) {
            return Err(PresenceError::Config(
                "tracker.keepalive_s must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lower-cases and checks a camera id against `^[a-z0-9_-]{1,64}$`.
pub fn validate_camera_id(camera_id: &str) -> Result<String> {
    static CAMERA_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = CAMERA_ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());
    let id = camera_id.trim().to_lowercase();
    if !re.is_match(&id) {
        return Err(PresenceError::Config(format!(
            "camera id '{}' must match ^[a-z0-9_-]{{1,64}}$",
            camera_id
        )));
    }
    Ok(id)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PresenceConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PresenceError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        PresenceError::Config(format!("invalid config file {}: {}", path.display(), e))
    })
}
