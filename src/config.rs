//! `config.yaml` shape (§6) and load path.
//!
//! Grounded on the teacher's `services/forwarder/src/config.rs`: a
//! `Raw*` deserialize-only shape with `Option` fields, merged into a
//! defaulted public `Config`. Parsing the user's own SSH client config
//! (`ssh_config_path` contents) stays an external collaborator's job --
//! this module only carries the path through.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::forward::rule::ForwardRule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub ssh_config_path: Option<PathBuf>,
    pub reconnect: ReconnectConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
    pub forwards: Vec<ForwardRule>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ssh_config_path: None,
            reconnect: ReconnectConfig::default(),
            session: SessionConfig::default(),
            log: LogConfig::default(),
            forwards: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: true,
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionConfig {
    pub auto_restore: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

// --- raw deserialization shape, all-optional -------------------------------

/// Every leaf is optional, so a partial document only touches the keys it
/// names. Used for the initial `Config::load` parse of `config.yaml`, where
/// `forwards` seeds the rule store.
#[derive(Debug, Deserialize, Default)]
pub struct RawConfig {
    ssh_config_path: Option<PathBuf>,
    reconnect: Option<RawReconnect>,
    session: Option<RawSession>,
    log: Option<RawLog>,
    #[serde(default)]
    forwards: Vec<RawForward>,
}

/// `config.update`'s params shape. Identical to `RawConfig` minus
/// `forwards` -- the rule set is owned by `forward.add`/`forward.delete`,
/// not by config replacement, so the wire shape a client can send here has
/// no field that could touch it.
#[derive(Debug, Deserialize, Default)]
pub struct RawConfigUpdate {
    ssh_config_path: Option<PathBuf>,
    reconnect: Option<RawReconnect>,
    session: Option<RawSession>,
    log: Option<RawLog>,
}

impl From<RawConfigUpdate> for RawConfig {
    fn from(u: RawConfigUpdate) -> Self {
        RawConfig {
            ssh_config_path: u.ssh_config_path,
            reconnect: u.reconnect,
            session: u.session,
            log: u.log,
            forwards: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawReconnect {
    enabled: Option<bool>,
    max_retries: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    initial_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    max_delay: Option<Duration>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSession {
    auto_restore: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLog {
    level: Option<String>,
    file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawForward {
    #[serde(default)]
    name: String,
    host: String,
    #[serde(rename = "type")]
    kind: String,
    local_port: u16,
    #[serde(default)]
    remote_host: Option<String>,
    #[serde(default)]
    remote_port: Option<u16>,
    #[serde(default)]
    auto_connect: bool,
}

impl Config {
    /// Load and merge `config.yaml` at `path` over the defaults. A missing
    /// file is not an error -- the daemon starts with an empty rule set.
    pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        let raw: RawConfig = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Config::default().merge(raw))
    }

    /// Applies a partial document over `self`, leaving any key it doesn't
    /// name untouched. Used both for the initial load (against
    /// `Config::default()`) and for `config.update` (against the live
    /// config, via `RawConfigUpdate`'s conversion, so `forwards` is always
    /// empty on that path and this always takes the `self.forwards.clone()`
    /// branch below).
    pub fn merge(&self, raw: RawConfig) -> Config {
        let reconnect = raw
            .reconnect
            .map(|r| ReconnectConfig {
                enabled: r.enabled.unwrap_or(self.reconnect.enabled),
                max_retries: r.max_retries.unwrap_or(self.reconnect.max_retries),
                initial_delay: r.initial_delay.unwrap_or(self.reconnect.initial_delay),
                max_delay: r.max_delay.unwrap_or(self.reconnect.max_delay),
            })
            .unwrap_or_else(|| self.reconnect.clone());
        let session = raw
            .session
            .map(|s| SessionConfig {
                auto_restore: s.auto_restore.unwrap_or(self.session.auto_restore),
            })
            .unwrap_or_else(|| self.session.clone());
        let log = raw
            .log
            .map(|l| LogConfig {
                level: l.level.unwrap_or_else(|| self.log.level.clone()),
                file: l.file.or_else(|| self.log.file.clone()),
            })
            .unwrap_or_else(|| self.log.clone());
        let forwards = if raw.forwards.is_empty() {
            self.forwards.clone()
        } else {
            raw.forwards
                .into_iter()
                .filter_map(|f| {
                    ForwardRule::new(
                        f.name,
                        f.host,
                        f.kind.parse().ok()?,
                        f.local_port,
                        f.remote_host,
                        f.remote_port,
                        f.auto_connect,
                        0,
                    )
                    .ok()
                })
                .collect()
        };
        Config {
            ssh_config_path: raw.ssh_config_path.or_else(|| self.ssh_config_path.clone()),
            reconnect,
            session,
            log,
            forwards,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(&tmp.path().join("config.yaml")).unwrap();
        assert!(cfg.reconnect.enabled);
        assert!(cfg.forwards.is_empty());
    }

    #[test]
    fn parses_documented_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
ssh_config_path: /home/user/.ssh/config
reconnect:
  enabled: false
  max_retries: 3
  initial_delay: "2s"
  max_delay: "30s"
log:
  level: debug
  file: ""
forwards:
  - name: web
    host: prod
    type: local
    local_port: 8080
    remote_port: 80
"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert!(!cfg.reconnect.enabled);
        assert_eq!(cfg.reconnect.max_retries, 3);
        assert_eq!(cfg.reconnect.initial_delay, Duration::from_secs(2));
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.forwards.len(), 1);
        assert_eq!(cfg.forwards[0].name, "web");
    }

    #[test]
    fn config_update_params_cannot_carry_forwards() {
        let existing = ForwardRule::new(
            "web".into(),
            "prod".into(),
            crate::forward::rule::ForwardType::Local,
            8080,
            None,
            Some(80),
            false,
            0,
        )
        .unwrap();
        let cfg = Config {
            forwards: vec![existing],
            ..Config::default()
        };

        // A client sending `forwards` through `config.update`'s shape has no
        // field to put it in -- the key is simply ignored, not applied.
        let raw: RawConfigUpdate = serde_json::from_str(
            r#"{"log": {"level": "debug"}, "forwards": [{"name": "evil", "host": "x", "type": "local", "local_port": 1}]}"#,
        )
        .unwrap();
        let updated = cfg.merge(raw.into());
        assert_eq!(updated.log.level, "debug");
        assert_eq!(updated.forwards.len(), 1);
        assert_eq!(updated.forwards[0].name, "web");
    }
}
