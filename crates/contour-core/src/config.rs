use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use contour_wire::{Framing, DEFAULT_MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{ContourError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub framing: Framing,
    pub max_frame_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Newline,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub startup_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub stderr_tail_lines: usize,
    /// Applied to submissions that carry no deadline of their own.
    pub command_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 15_000,
            stop_grace_ms: 2_000,
            stderr_tail_lines: 500,
            command_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub auto_restart: bool,
    pub max_failures: u32,
    pub cooldown_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_failures: 3,
            cooldown_ms: 30_000,
            restart_delay_ms: 500,
        }
    }
}

impl SupervisorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Overrides the models directory derived from the user dir.
    pub models_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_days: u64,
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            logs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ContourConfig {
    pub protocol: ProtocolConfig,
    pub session: SessionConfig,
    pub supervisor: SupervisorConfig,
    pub artifacts: ArtifactsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

impl ConfigLayers {
    fn merged(&self) -> Value {
        let mut merged =
            serde_json::to_value(ContourConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &self.global);
        deep_merge(&mut merged, &self.project);
        deep_merge(&mut merged, &self.env);
        deep_merge(&mut merged, &self.cli);
        merged
    }
}

/// Which file a patch is persisted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Global,
    Project,
}

/// Layered JSON configuration: global < project < env < cli.
#[derive(Clone)]
pub struct ConfigStore {
    global_path: PathBuf,
    project_path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn open(
        global_path: impl AsRef<Path>,
        project_path: Option<PathBuf>,
        cli_overrides: Option<Value>,
    ) -> Result<Self> {
        let global_path = global_path.as_ref().to_path_buf();
        let global = read_json_file(&global_path).await?;
        let project = match &project_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        tracing::debug!(
            global = %global_path.display(),
            project = ?project_path,
            "config layers loaded"
        );
        Ok(Self {
            global_path,
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    /// A store with only defaults plus the given overrides; nothing is read or written.
    pub fn in_memory(cli_overrides: Option<Value>) -> Self {
        Self {
            global_path: PathBuf::new(),
            project_path: None,
            layers: Arc::new(RwLock::new(ConfigLayers {
                global: empty_object(),
                project: empty_object(),
                env: empty_object(),
                cli: cli_overrides.unwrap_or_else(empty_object),
            })),
        }
    }

    pub async fn get(&self) -> Result<ContourConfig> {
        decode(self.get_effective_value().await)
    }

    pub async fn get_effective_value(&self) -> Value {
        self.layers.read().await.merged()
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    /// Merges `patch` into one file-backed layer and writes that layer back.
    /// A patch that would leave the effective config undecodable is refused
    /// and nothing is written.
    pub async fn patch(&self, scope: ConfigScope, patch: Value) -> Result<ContourConfig> {
        let path = match scope {
            ConfigScope::Global => self.global_path.clone(),
            ConfigScope::Project => self.project_path.clone().ok_or_else(|| {
                ContourError::InvalidConfig("no project config file is open".to_string())
            })?,
        };
        let mut layers = self.layers.write().await;
        let mut candidate = layers.clone();
        let layer = match scope {
            ConfigScope::Global => &mut candidate.global,
            ConfigScope::Project => &mut candidate.project,
        };
        deep_merge(layer, &patch);
        let snapshot = layer.clone();
        let config = decode(candidate.merged())?;
        write_json_file(&path, &snapshot).await?;
        *layers = candidate;
        tracing::info!(path = %path.display(), "config patched");
        Ok(config)
    }
}

/// Nested patch that sets the dotted `key` to `value`, e.g.
/// `session.stop_grace_ms` becomes `{"session": {"stop_grace_ms": value}}`.
pub fn patch_for_key(key: &str, value: Value) -> Result<Value> {
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        return Err(ContourError::InvalidConfig(format!(
            "{key:?} is not a dotted config key"
        )));
    }
    Ok(segments
        .iter()
        .rev()
        .fold(value, |inner, segment| {
            let mut map = Map::new();
            map.insert(segment.to_string(), inner);
            Value::Object(map)
        }))
}

fn decode(value: Value) -> Result<ContourConfig> {
    serde_json::from_value(value).map_err(|err| ContourError::InvalidConfig(err.to_string()))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    serde_json::from_str::<Value>(&raw).map_err(|err| {
        ContourError::InvalidConfig(format!("{}: {}", path.display(), err))
    })
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

/// Builds the env layer from `CONTOUR_*` variables using `lookup`.
pub fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(framing) = get("CONTOUR_FRAMING") {
        let framing = match framing.trim().to_ascii_lowercase().as_str() {
            "newline" | "line" => Some("newline"),
            "length_prefixed" | "length-prefixed" | "length" => Some("length_prefixed"),
            _ => None,
        };
        if let Some(framing) = framing {
            deep_merge(&mut root, &json!({ "protocol": { "framing": framing } }));
        }
    }
    if let Some(v) = get("CONTOUR_MAX_FRAME_BYTES").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "protocol": { "max_frame_bytes": v } }));
    }
    if let Some(v) = get("CONTOUR_STARTUP_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "session": { "startup_timeout_ms": v } }));
    }
    if let Some(v) = get("CONTOUR_STOP_GRACE_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "session": { "stop_grace_ms": v } }));
    }
    if let Some(v) = get("CONTOUR_COMMAND_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "session": { "command_timeout_ms": v } }));
    }
    if let Some(v) = get("CONTOUR_AUTO_RESTART").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "supervisor": { "auto_restart": v } }));
    }
    if let Some(v) = get("CONTOUR_MAX_FAILURES").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "supervisor": { "max_failures": v } }));
    }
    if let Some(dir) = get("CONTOUR_MODELS_DIR") {
        deep_merge(&mut root, &json!({ "artifacts": { "models_dir": dir } }));
    }
    if let Some(v) = get("CONTOUR_LOG_RETENTION_DAYS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "logging": { "retention_days": v } }));
    }

    root
}

pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
