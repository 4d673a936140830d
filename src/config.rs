//! YAML session configuration and hot reload of effect inputs.

use crate::buffer::PoolConfig;
use crate::effect::ParamValue;
use crate::error::ConfigError;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::{error, info, warn};

/// Refresh clock driving the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ClockKind {
    /// Fixed-interval timer at `fps`
    #[default]
    Timer,
    /// Display refresh callback (macOS)
    DisplayLink,
}

/// Where rendered frames go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    /// Log each published frame
    #[default]
    Log,
    /// v4l2loopback device (Linux)
    VirtualCamera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub retention_ms: u64,
    pub max_free: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            retention_ms: 1000,
            max_free: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: Option<PathBuf>,
    /// Effect definition; passthrough when unset
    pub effect: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub clock: ClockKind,
    pub pool: PoolSettings,
    pub output: OutputKind,
    pub device: PathBuf,
    pub flipped: bool,
    pub parameters: BTreeMap<String, ParamValue>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video: None,
            effect: None,
            width: 1280,
            height: 720,
            fps: 60,
            clock: ClockKind::default(),
            pool: PoolSettings::default(),
            output: OutputKind::default(),
            device: PathBuf::from("/dev/video10"),
            flipped: false,
            parameters: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            retention: Duration::from_millis(self.pool.retention_ms),
            max_free: self.pool.max_free,
        }
    }
}

/// Parameters that are new or changed in `new` relative to `old`.
pub fn changed_parameters(old: Option<&Config>, new: &Config) -> Vec<(String, ParamValue)> {
    new.parameters
        .iter()
        .filter(|(name, value)| old.and_then(|o| o.parameters.get(*name)) != Some(*value))
        .map(|(name, value)| (name.clone(), *value))
        .collect()
}

/// Watches the config file and reports reloaded configurations.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    current_config: Option<Config>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Option<Self> {
        let (tx, rx) = channel();
        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("Failed to watch config file {:?}: {}", path, e);
            return None;
        }
        info!("Watching config file {:?} for changes", path);

        let current_config = Config::load(&path).ok();
        Some(Self {
            path,
            _watcher: watcher,
            rx,
            current_config,
        })
    }

    /// Drain pending file events and return `(old, new)` if the file was
    /// rewritten with a valid config.
    pub fn check_for_changes(&mut self) -> Option<(Option<Config>, Config)> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    needs_reload = true;
                }
            }
        }
        if !needs_reload {
            return None;
        }

        info!("Config file changed, reloading");
        match Config::load(&self.path) {
            Ok(new_config) if Some(&new_config) == self.current_config.as_ref() => None,
            Ok(new_config) => {
                let old = self.current_config.replace(new_config.clone());
                Some((old, new_config))
            }
            Err(e) => {
                error!("Failed to reload config: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.pool_config(), PoolConfig::default());
        assert!(!config.flipped);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
video: clip.mp4
effect: effects/glow.yaml
fps: 30
clock: display-link
output: virtual-camera
pool:
  retention_ms: 250
parameters:
  intensity: 0.5
  enabled: true
  tint: [1.0, 0.0, 0.0, 1.0]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.video, Some(PathBuf::from("clip.mp4")));
        assert_eq!(config.clock, ClockKind::DisplayLink);
        assert_eq!(config.output, OutputKind::VirtualCamera);
        assert_eq!(config.pool.retention_ms, 250);
        assert_eq!(config.pool.max_free, 16);
        assert_eq!(config.parameters["intensity"], ParamValue::Float(0.5));
        assert_eq!(config.parameters["enabled"], ParamValue::Bool(true));
    }

    #[test]
    fn test_unknown_clock_rejected() {
        assert!(matches!(
            Config::from_yaml("clock: vsync"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_changed_parameters() {
        let old = Config::from_yaml("parameters: {a: 1.0, b: 2.0}").unwrap();
        let new = Config::from_yaml("parameters: {a: 1.0, b: 3.0, c: true}").unwrap();
        let changed = changed_parameters(Some(&old), &new);
        assert_eq!(
            changed,
            vec![
                ("b".to_string(), ParamValue::Float(3.0)),
                ("c".to_string(), ParamValue::Bool(true)),
            ]
        );
        assert_eq!(changed_parameters(None, &old).len(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            Config::load("/nonexistent/surfacefx.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
