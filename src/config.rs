use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::comm::BridgeConfig;
use crate::document::Theme;
use crate::frame::renderer::{HttpRendererSource, RendererCache, RendererPlan};
use crate::frame::FrameConfig;

pub const CONFIG_ENV: &str = "OUTFRAME_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse renderer URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    frame: RawFrame,
    bridge: RawBridge,
    renderer: Option<RawRenderer>,
    theme: Theme,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawFrame {
    min_height: u32,
    max_height: u32,
    queue_capacity: usize,
    ready_timeout_ms: u64,
}

impl Default for RawFrame {
    fn default() -> Self {
        let defaults = FrameConfig::default();
        Self {
            min_height: defaults.min_height,
            max_height: defaults.max_height,
            queue_capacity: defaults.queue_capacity,
            ready_timeout_ms: defaults.ready_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawBridge {
    buffer_capacity: usize,
}

impl Default for RawBridge {
    fn default() -> Self {
        Self {
            buffer_capacity: BridgeConfig::default().buffer_capacity,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRenderer {
    script_url: String,
    stylesheet_url: String,
    #[serde(default)]
    sha256: Option<String>,
}

/// Where the richer renderer bundle lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererLocation {
    pub script_url: Url,
    pub stylesheet_url: Url,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutframeConfig {
    pub frame: FrameConfig,
    pub bridge: BridgeConfig,
    /// `None` keeps every frame on the inline renderer.
    pub renderer: Option<RendererLocation>,
    pub theme: Theme,
}

impl OutframeConfig {
    /// Load from `path`, falling back to defaults when no path is given or
    /// the file does not exist.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(&path)?;
                tracing::debug!(path = %path.display(), "loaded config");
                Self::from_yaml(&contents)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = if contents.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        Self::from_raw(raw)
    }

    /// `$OUTFRAME_CONFIG`, else `outframe.yaml` in the platform config dir.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        ProjectDirs::from("org", "Outframe", "outframe")
            .map(|dirs| dirs.config_dir().join("outframe.yaml"))
    }

    /// Build the renderer plan for new frames. Frames built from the same
    /// cache share one fetch.
    pub fn renderer_plan(&self, cache: Arc<RendererCache>) -> RendererPlan {
        match &self.renderer {
            None => RendererPlan::Inline,
            Some(location) => {
                let mut source = HttpRendererSource::new(
                    location.script_url.clone(),
                    location.stylesheet_url.clone(),
                );
                if let Some(digest) = &location.sha256 {
                    source = source.with_sha256(digest.clone());
                }
                RendererPlan::upgrade(cache, Arc::new(source))
            }
        }
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let RawConfig {
            frame,
            bridge,
            renderer,
            theme,
        } = raw;

        if frame.min_height > frame.max_height {
            return Err(ConfigError::Invalid(format!(
                "frame.min_height ({}) exceeds frame.max_height ({})",
                frame.min_height, frame.max_height
            )));
        }
        if frame.queue_capacity == 0 {
            return Err(ConfigError::Invalid("frame.queue_capacity must be positive".into()));
        }
        if frame.ready_timeout_ms == 0 {
            return Err(ConfigError::Invalid("frame.ready_timeout_ms must be positive".into()));
        }
        if bridge.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("bridge.buffer_capacity must be positive".into()));
        }

        let renderer = renderer.map(parse_renderer).transpose()?;

        Ok(Self {
            frame: FrameConfig {
                min_height: frame.min_height,
                max_height: frame.max_height,
                queue_capacity: frame.queue_capacity,
                ready_timeout: Duration::from_millis(frame.ready_timeout_ms),
            },
            bridge: BridgeConfig {
                buffer_capacity: bridge.buffer_capacity,
            },
            renderer,
            theme,
        })
    }
}

fn parse_renderer(raw: RawRenderer) -> Result<RendererLocation, ConfigError> {
    if let Some(digest) = &raw.sha256 {
        if digest.len() != 64 || hex::decode(digest).is_err() {
            return Err(ConfigError::Invalid(
                "renderer.sha256 must be 64 hex characters".into(),
            ));
        }
    }
    Ok(RendererLocation {
        script_url: Url::parse(&raw.script_url)?,
        stylesheet_url: Url::parse(&raw.stylesheet_url)?,
        sha256: raw.sha256,
    })
}
