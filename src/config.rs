use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{ClassFilter, DEFAULT_VEHICLE_CLASSES};
use crate::gallery::GalleryConfig;
use crate::ingest::RtspConfig;
use crate::pipeline::{RetryPolicy, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::ptz::PtzConfig;
use crate::store::{ArtifactFormat, EVENT_LOG_FILE};

const DEFAULT_STREAM_URL: &str = "stub://roadway";
const DEFAULT_STREAM_FPS: u32 = 10;
const DEFAULT_STREAM_WIDTH: u32 = 640;
const DEFAULT_STREAM_HEIGHT: u32 = 480;
const DEFAULT_DETECTOR: &str = "cpu";
const DEFAULT_ARTIFACT_DIR: &str = "./labeled_dataset";
const DEFAULT_IMAGE_FORMAT: &str = "jpg";
const DEFAULT_PTZ_TIMEOUT_MS: u64 = 2000;
const DEFAULT_PTZ_MIN_INTERVAL_MS: u64 = 200;

#[derive(Debug, Deserialize, Default)]
struct RoadwatchConfigFile {
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
    ptz: Option<PtzConfigFile>,
    store: Option<StoreConfigFile>,
    gallery: Option<GalleryConfigFile>,
    retry: Option<RetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    classes: Option<Vec<usize>>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PtzConfigFile {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout_ms: Option<u64>,
    min_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    artifact_dir: Option<PathBuf>,
    event_log: Option<PathBuf>,
    image_format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct GalleryConfigFile {
    addr: Option<String>,
    limit: Option<usize>,
    title: Option<String>,
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    max_retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub stream: StreamSettings,
    pub detector: DetectorSettings,
    pub ptz: PtzSettings,
    pub store: StoreSettings,
    pub gallery: GalleryConfig,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub classes: Vec<usize>,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct PtzSettings {
    /// Unset disables camera control.
    pub url: Option<String>,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub artifact_dir: PathBuf,
    /// Explicit log path; defaults to a file inside `artifact_dir`.
    pub event_log: Option<PathBuf>,
    pub image_format: ArtifactFormat,
}

impl StoreSettings {
    pub fn event_log_path(&self) -> PathBuf {
        self.event_log
            .clone()
            .unwrap_or_else(|| self.artifact_dir.join(EVENT_LOG_FILE))
    }
}

impl RoadwatchConfig {
    /// File from `ROADWATCH_CONFIG` (if set), then env overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit file taking the place of
    /// `ROADWATCH_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Result<Self> {
        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            target_fps: stream.target_fps.unwrap_or(DEFAULT_STREAM_FPS),
            width: stream.width.unwrap_or(DEFAULT_STREAM_WIDTH),
            height: stream.height.unwrap_or(DEFAULT_STREAM_HEIGHT),
        };

        let detector = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            model_path: detector.model_path,
            classes: detector
                .classes
                .unwrap_or_else(|| DEFAULT_VEHICLE_CLASSES.to_vec()),
            confidence_threshold: detector
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
        };

        let ptz = file.ptz.unwrap_or_default();
        let ptz = PtzSettings {
            url: ptz.url.filter(|url| !url.trim().is_empty()),
            username: ptz.username.unwrap_or_default(),
            password: ptz.password.unwrap_or_default(),
            timeout: Duration::from_millis(ptz.timeout_ms.unwrap_or(DEFAULT_PTZ_TIMEOUT_MS)),
            min_interval: Duration::from_millis(
                ptz.min_interval_ms.unwrap_or(DEFAULT_PTZ_MIN_INTERVAL_MS),
            ),
        };

        let store = file.store.unwrap_or_default();
        let format_name = store
            .image_format
            .unwrap_or_else(|| DEFAULT_IMAGE_FORMAT.to_string());
        let store = StoreSettings {
            artifact_dir: store
                .artifact_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR)),
            event_log: store.event_log,
            image_format: ArtifactFormat::parse(&format_name)
                .ok_or_else(|| anyhow!("unknown image format '{}'", format_name))?,
        };

        let defaults = GalleryConfig::default();
        let gallery = file.gallery.unwrap_or_default();
        let gallery = GalleryConfig {
            addr: gallery.addr.unwrap_or(defaults.addr),
            limit: gallery.limit.unwrap_or(defaults.limit),
            title: gallery.title.unwrap_or(defaults.title),
            max_connections: gallery.max_connections.unwrap_or(defaults.max_connections),
        };

        let defaults = RetryPolicy::default();
        let retry = file.retry.unwrap_or_default();
        let retry = RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff: retry
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: retry
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        };

        Ok(Self {
            stream,
            detector,
            ptz,
            store,
            gallery,
            retry,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("ROADWATCH_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(backend) = env_nonempty("ROADWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_nonempty("ROADWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(classes) = env_nonempty("ROADWATCH_CLASSES") {
            self.detector.classes = split_csv(&classes)
                .iter()
                .map(|id| {
                    id.parse::<usize>()
                        .map_err(|_| anyhow!("ROADWATCH_CLASSES entry '{}' is not a class id", id))
                })
                .collect::<Result<_>>()?;
        }
        if let Some(threshold) = env_nonempty("ROADWATCH_CONFIDENCE_THRESHOLD") {
            self.detector.confidence_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Some(url) = env_nonempty("ROADWATCH_PTZ_URL") {
            self.ptz.url = Some(url);
        }
        if let Some(username) = env_nonempty("ROADWATCH_PTZ_USERNAME") {
            self.ptz.username = username;
        }
        if let Ok(password) = std::env::var("ROADWATCH_PTZ_PASSWORD") {
            self.ptz.password = password;
        }
        if let Some(dir) = env_nonempty("ROADWATCH_ARTIFACT_DIR") {
            self.store.artifact_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_nonempty("ROADWATCH_EVENT_LOG") {
            self.store.event_log = Some(PathBuf::from(path));
        }
        if let Some(addr) = env_nonempty("ROADWATCH_GALLERY_ADDR") {
            self.gallery.addr = addr;
        }
        if let Some(retries) = env_nonempty("ROADWATCH_MAX_RETRIES") {
            self.retry.max_retries = retries
                .parse()
                .map_err(|_| anyhow!("ROADWATCH_MAX_RETRIES must be a non-negative integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let threshold = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence_threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        self.class_filter()?;
        self.detector.backend = self.detector.backend.trim().to_lowercase();

        if self.stream.target_fps == 0 || self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("stream fps, width and height must be greater than zero"));
        }
        if self.gallery.limit == 0 {
            return Err(anyhow!("gallery limit must be at least 1"));
        }
        if self.gallery.max_connections == 0 {
            return Err(anyhow!("gallery max_connections must be at least 1"));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(anyhow!(
                "retry max_backoff_ms must be at least initial_backoff_ms"
            ));
        }
        if let Some(url) = &self.ptz.url {
            let parsed =
                url::Url::parse(url).with_context(|| format!("invalid ptz url '{}'", url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("ptz url must be http or https"));
            }
        }
        Ok(())
    }

    pub fn class_filter(&self) -> Result<ClassFilter> {
        ClassFilter::from_class_ids(&self.detector.classes)
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.stream.url.clone(),
            target_fps: self.stream.target_fps,
            width: self.stream.width,
            height: self.stream.height,
        }
    }

    /// `None` when no PTZ endpoint is configured.
    pub fn ptz_config(&self) -> Option<PtzConfig> {
        self.ptz.url.as_ref().map(|url| PtzConfig {
            url: url.clone(),
            username: self.ptz.username.clone(),
            password: self.ptz.password.clone(),
            timeout: self.ptz.timeout,
            min_interval: self.ptz.min_interval,
        })
    }
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
