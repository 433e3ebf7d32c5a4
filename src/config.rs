use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::control::{clamp_scale, DEFAULT_PROCESSING_SCALE};
use crate::expert::{ExpertKind, ExpertRegistry, ExpertSchedule};
use crate::liveness::LivenessSettings;
use crate::publish::DEFAULT_QUEUE_DEPTH;
use crate::router::RouterSettings;
use crate::server::ServerConfig;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_EVICTION_SECS: u64 = 60 * 60;
const DEFAULT_LIVENESS_SWEEP_MS: u64 = 500;
const DEFAULT_FPS_WINDOW_SECS: u64 = 5;
const DEFAULT_FPS_WINDOW_SAMPLES: usize = 60;
const DEFAULT_EXPERT_INTERVAL_MS: u64 = 1000;
/// Detection-style cadence: 5 invocations per second.
const DEFAULT_MOTION_INTERVAL_MS: u64 = 200;
/// Caption-style cadence: one invocation every 3 seconds.
const DEFAULT_FRAME_INFO_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RouterdConfigFile {
    listen_addr: Option<String>,
    heartbeat_timeout_secs: Option<u64>,
    eviction_secs: Option<u64>,
    liveness_sweep_ms: Option<u64>,
    fps_window_secs: Option<u64>,
    fps_window_samples: Option<usize>,
    subscriber_queue: Option<usize>,
    processing_scale: Option<f32>,
    experts: Option<Vec<ExpertConfigFile>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpertConfigFile {
    name: String,
    kind: ExpertKind,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    enabled: Option<bool>,
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RouterdConfig {
    pub listen_addr: String,
    pub heartbeat_timeout: Duration,
    /// `None` keeps disconnected cameras forever.
    pub eviction_after: Option<Duration>,
    pub liveness_sweep: Duration,
    pub fps_window: Duration,
    pub fps_samples: usize,
    pub subscriber_queue: usize,
    pub processing_scale: f32,
    pub experts: Vec<ExpertSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpertSettings {
    pub name: String,
    pub kind: ExpertKind,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub enabled: bool,
    pub url: Option<String>,
}

impl RouterdConfig {
    /// Defaults, then the file named by `ROUTER_CONFIG`, then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROUTER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RouterdConfigFile) -> Self {
        let experts = match file.experts {
            Some(experts) => experts
                .into_iter()
                .map(|expert| ExpertSettings {
                    name: expert.name.trim().to_string(),
                    kind: expert.kind,
                    interval: Duration::from_millis(
                        expert.interval_ms.unwrap_or(DEFAULT_EXPERT_INTERVAL_MS),
                    ),
                    timeout: expert.timeout_ms.map(Duration::from_millis),
                    enabled: expert.enabled.unwrap_or(true),
                    url: expert.url,
                })
                .collect(),
            None => default_experts(),
        };
        Self {
            listen_addr: file
                .listen_addr
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            heartbeat_timeout: Duration::from_secs(
                file.heartbeat_timeout_secs
                    .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            ),
            eviction_after: eviction(file.eviction_secs.unwrap_or(DEFAULT_EVICTION_SECS)),
            liveness_sweep: Duration::from_millis(
                file.liveness_sweep_ms.unwrap_or(DEFAULT_LIVENESS_SWEEP_MS),
            ),
            fps_window: Duration::from_secs(
                file.fps_window_secs.unwrap_or(DEFAULT_FPS_WINDOW_SECS),
            ),
            fps_samples: file.fps_window_samples.unwrap_or(DEFAULT_FPS_WINDOW_SAMPLES),
            subscriber_queue: file.subscriber_queue.unwrap_or(DEFAULT_QUEUE_DEPTH),
            processing_scale: file.processing_scale.unwrap_or(DEFAULT_PROCESSING_SCALE),
            experts,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("ROUTER_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
        if let Ok(timeout) = std::env::var("ROUTER_HEARTBEAT_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("ROUTER_HEARTBEAT_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.heartbeat_timeout = Duration::from_secs(seconds);
        }
        if let Ok(evict) = std::env::var("ROUTER_EVICTION_SECS") {
            let seconds: u64 = evict.trim().parse().map_err(|_| {
                anyhow!("ROUTER_EVICTION_SECS must be an integer number of seconds")
            })?;
            self.eviction_after = eviction(seconds);
        }
        if let Ok(scale) = std::env::var("ROUTER_PROCESSING_SCALE") {
            self.processing_scale = scale
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROUTER_PROCESSING_SCALE must be a number"))?;
        }
        if let Ok(disabled) = std::env::var("ROUTER_DISABLED_EXPERTS") {
            for name in split_csv(&disabled) {
                let expert = self
                    .experts
                    .iter_mut()
                    .find(|expert| expert.name == name)
                    .ok_or_else(|| {
                        anyhow!("ROUTER_DISABLED_EXPERTS names unknown expert '{}'", name)
                    })?;
                expert.enabled = false;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("listen_addr '{}' is not a socket address", self.listen_addr))?;
        if self.heartbeat_timeout.is_zero() {
            return Err(anyhow!("heartbeat timeout must be greater than zero"));
        }
        if self.liveness_sweep.is_zero() {
            return Err(anyhow!("liveness_sweep_ms must be greater than zero"));
        }
        if self.fps_window.is_zero() {
            return Err(anyhow!("fps_window_secs must be greater than zero"));
        }
        if self.fps_samples < 2 {
            return Err(anyhow!("fps_window_samples must be at least 2"));
        }
        if self.subscriber_queue == 0 {
            return Err(anyhow!("subscriber_queue must be greater than zero"));
        }
        if !self.processing_scale.is_finite() {
            return Err(anyhow!("processing_scale must be a finite number"));
        }
        let clamped = clamp_scale(self.processing_scale);
        if clamped != self.processing_scale {
            log::warn!(
                "processing_scale {} clamped to {}",
                self.processing_scale,
                clamped
            );
            self.processing_scale = clamped;
        }

        if self.experts.is_empty() {
            return Err(anyhow!("at least one expert must be configured"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for expert in &self.experts {
            if expert.name.is_empty() {
                return Err(anyhow!("expert name must not be empty"));
            }
            if !seen.insert(expert.name.as_str()) {
                return Err(anyhow!("duplicate expert name '{}'", expert.name));
            }
            if expert.interval.is_zero() {
                return Err(anyhow!(
                    "expert '{}': interval_ms must be greater than zero",
                    expert.name
                ));
            }
            if expert.timeout.map(|t| t.is_zero()).unwrap_or(false) {
                return Err(anyhow!(
                    "expert '{}': timeout_ms must be greater than zero",
                    expert.name
                ));
            }
            if expert.kind == ExpertKind::Remote && expert.url.is_none() {
                return Err(anyhow!("expert '{}': kind remote requires url", expert.name));
            }
        }
        Ok(())
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            liveness: LivenessSettings {
                heartbeat_timeout: self.heartbeat_timeout,
                eviction_after: self.eviction_after,
                fps_samples: self.fps_samples,
                fps_window: self.fps_window,
            },
            liveness_sweep: self.liveness_sweep,
            subscriber_queue: self.subscriber_queue,
            processing_scale: self.processing_scale,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.listen_addr.clone(),
            ..ServerConfig::default()
        }
    }

    /// Instantiate and register every configured expert.
    pub fn build_registry(&self) -> Result<ExpertRegistry> {
        let mut registry = ExpertRegistry::new();
        for settings in &self.experts {
            let expert = settings
                .kind
                .instantiate(&settings.name, settings.url.as_deref(), settings.timeout)?;
            let mut schedule = ExpertSchedule::every(settings.interval);
            if let Some(timeout) = settings.timeout {
                schedule = schedule.with_timeout(timeout);
            }
            registry
                .register_shared(expert, schedule, settings.enabled)
                .with_context(|| format!("register expert '{}'", settings.name))?;
        }
        Ok(registry)
    }
}

fn default_experts() -> Vec<ExpertSettings> {
    vec![
        ExpertSettings {
            name: "motion".to_string(),
            kind: ExpertKind::Motion,
            interval: Duration::from_millis(DEFAULT_MOTION_INTERVAL_MS),
            timeout: None,
            enabled: true,
            url: None,
        },
        ExpertSettings {
            name: "frame_info".to_string(),
            kind: ExpertKind::FrameInfo,
            interval: Duration::from_millis(DEFAULT_FRAME_INFO_INTERVAL_MS),
            timeout: None,
            enabled: true,
            url: None,
        },
    ]
}

fn eviction(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

fn read_config_file(path: &Path) -> Result<RouterdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
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
