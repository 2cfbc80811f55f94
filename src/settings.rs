//! Persistent application settings and on-disk layout.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{
    DnsConfig, DomainStrategy, InboundConfig, LogConfig, LogLevel, MuxConfig, OutboundConfig,
    ProxySessionConfig, RoutingConfig, RoutingRule, StatsConfig,
};
use crate::error::{LinkError, SettingsError};
use crate::link::{self, OutboundNode};
use crate::session::{StartRequest, StopMode};

const SETTINGS_FILE: &str = "settings.json";
const CONFIG_FILE: &str = "config.json";
const LOGS_DIR: &str = "logs";
const ACCESS_LOG: &str = "access.log";
const ERROR_LOG: &str = "error.log";

/// Where raybar keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    home: PathBuf,
}

impl AppPaths {
    /// Uses `home` when given, else the platform data directory.
    pub fn resolve(home: Option<PathBuf>) -> Result<Self, SettingsError> {
        let home = match home {
            Some(home) => home,
            None => ProjectDirs::from("", "raybar", "Raybar")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(SettingsError::NoHome)?,
        };
        Ok(Self { home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join(SETTINGS_FILE)
    }

    /// The document the engine is started with.
    pub fn config_file(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join(LOGS_DIR)
    }

    pub fn access_log(&self) -> PathBuf {
        self.logs_dir().join(ACCESS_LOG)
    }

    pub fn error_log(&self) -> PathBuf {
        self.logs_dir().join(ERROR_LOG)
    }

    pub fn ensure(&self) -> Result<(), SettingsError> {
        let logs = self.logs_dir();
        fs::create_dir_all(&logs).map_err(|source| SettingsError::Io { path: logs, source })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogSettings {
    pub enable_access: bool,
    pub enable_error: bool,
    pub level: LogLevel,
    pub enable_dns: bool,
    pub enable_mask_address: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        let log = LogConfig::default();
        Self {
            enable_access: log.enable_access,
            enable_error: log.enable_error,
            level: log.level,
            enable_dns: log.enable_dns,
            enable_mask_address: log.enable_mask_address,
        }
    }
}

/// A routing rule as stored, with an on/off switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub rule: RoutingRule,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    pub domain_strategy: DomainStrategy,
    pub rules: Vec<RuleEntry>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let routing = RoutingConfig::default();
        Self {
            domain_strategy: routing.domain_strategy,
            rules: routing
                .rules
                .into_iter()
                .map(|rule| RuleEntry {
                    enabled: true,
                    rule,
                })
                .collect(),
        }
    }
}

/// Contents of `settings.json`. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub engine_path: Option<PathBuf>,
    pub active_link: Option<String>,
    pub links: Vec<String>,
    /// Stored for the user; fetching is done elsewhere.
    pub subscription_url: Option<String>,
    pub stop_mode: StopMode,
    pub reap_orphans: bool,
    pub log: LogSettings,
    pub dns: DnsConfig,
    pub inbound: InboundConfig,
    pub mux: MuxConfig,
    pub routing: RoutingSettings,
    pub stats: StatsConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine_path: None,
            active_link: None,
            links: Vec::new(),
            subscription_url: None,
            stop_mode: StopMode::default(),
            reap_orphans: true,
            log: LogSettings::default(),
            dns: DnsConfig::default(),
            inbound: InboundConfig::default(),
            mux: MuxConfig::default(),
            routing: RoutingSettings::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl AppSettings {
    /// Loads settings, writing defaults on first run.
    pub fn load_or_init(paths: &AppPaths) -> Result<Self, SettingsError> {
        let path = paths.settings_file();
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let settings: Self = serde_json::from_str(&raw)
                    .map_err(|source| SettingsError::Parse { path: path.clone(), source })?;
                settings.validate()?;
                debug!(path = %path.display(), "settings loaded");
                Ok(settings)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                settings.save(paths)?;
                info!(path = %path.display(), "created default settings");
                Ok(settings)
            }
            Err(source) => Err(SettingsError::Io { path, source }),
        }
    }

    /// Writes settings through a temp file so a crash never leaves a
    /// truncated file behind.
    pub fn save(&self, paths: &AppPaths) -> Result<(), SettingsError> {
        let path = paths.settings_file();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| SettingsError::Io { path, source }
        };
        fs::create_dir_all(paths.home()).map_err(io_err(paths.home()))?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|source| SettingsError::Parse { path: path.clone(), source })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field, reason: String| SettingsError::Invalid { field, reason };
        if self.inbound.port_http == 0 {
            return Err(invalid("inbound.portHttp", "must be non-zero".into()));
        }
        if self.inbound.port_socks == 0 {
            return Err(invalid("inbound.portSocks", "must be non-zero".into()));
        }
        if self.inbound.port_http == self.inbound.port_socks {
            return Err(invalid(
                "inbound.portSocks",
                format!("same as the http port {}", self.inbound.port_http),
            ));
        }
        if self.mux.concurrency < 1 || self.mux.xudp_concurrency < 1 {
            return Err(invalid("mux", "concurrency must be at least 1".into()));
        }
        for entry in &self.routing.rules {
            entry
                .rule
                .validate()
                .map_err(|reason| invalid("routing.rules", reason))?;
        }
        Ok(())
    }

    /// Assembles the session config; disabled rules are dropped.
    pub fn session_config(&self, paths: &AppPaths) -> ProxySessionConfig {
        ProxySessionConfig {
            log: LogConfig {
                enable_access: self.log.enable_access,
                access_path: Some(paths.access_log()),
                enable_error: self.log.enable_error,
                error_path: Some(paths.error_log()),
                level: self.log.level,
                enable_dns: self.log.enable_dns,
                enable_mask_address: self.log.enable_mask_address,
            },
            dns: self.dns.clone(),
            inbound: self.inbound.clone(),
            outbound: OutboundConfig {
                link: self.active_link.clone().unwrap_or_default(),
                mux: self.mux.clone(),
            },
            routing: RoutingConfig {
                domain_strategy: self.routing.domain_strategy,
                rules: self
                    .routing
                    .rules
                    .iter()
                    .filter(|entry| entry.enabled)
                    .map(|entry| entry.rule.clone())
                    .collect(),
            },
            stats: self.stats,
        }
    }

    /// Everything a session start needs.
    pub fn start_request(&self, paths: &AppPaths) -> StartRequest {
        StartRequest {
            executable: self.engine_path.clone(),
            config_path: paths.config_file(),
            config: self.session_config(paths),
        }
    }

    /// Saves a link after checking it parses. Returns the parsed node.
    pub fn add_link(&mut self, link: &str) -> Result<OutboundNode, LinkError> {
        let link = link.trim();
        let node = link::parse(link)?;
        if !self.links.iter().any(|saved| saved == link) {
            self.links.push(link.to_string());
        }
        Ok(node)
    }

    /// Adds every parsable link from a subscription body; returns how
    /// many were new and the links that failed to parse.
    pub fn import_subscription(&mut self, body: &str) -> (usize, Vec<(String, LinkError)>) {
        let mut added = 0;
        let mut rejected = Vec::new();
        for link in link::decode_subscription(body) {
            let known = self.links.contains(&link);
            match self.add_link(&link) {
                Ok(_) if !known => added += 1,
                Ok(_) => {}
                Err(err) => rejected.push((link, err)),
            }
        }
        (added, rejected)
    }

    /// Saved links with their parse result.
    pub fn nodes(&self) -> Vec<(&str, Result<OutboundNode, LinkError>)> {
        self.links
            .iter()
            .map(|link| (link.as_str(), link::parse(link)))
            .collect()
    }

    /// Makes the node named `name` (or with exactly that link) active.
    pub fn use_node(&mut self, name: &str) -> Result<OutboundNode, SettingsError> {
        let found = self.links.iter().find_map(|link| {
            let node = link::parse(link).ok()?;
            (node.name == name || link == name).then(|| (link.clone(), node))
        });
        match found {
            Some((link, node)) => {
                self.active_link = Some(link);
                Ok(node)
            }
            None => Err(SettingsError::Invalid {
                field: "activeLink",
                reason: format!("no saved node named {name:?}"),
            }),
        }
    }
}
