//! TOML configuration for the iceperf agent.
//!
//! Lookup order: an explicit `--config` path, then the `ICEPERF_CONFIG`
//! environment variable, then `./iceperf.toml`, then compiled-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ICEPERF_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "iceperf.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Location label attached to every result.
    pub node_id: String,
    pub test: TestConfig,
    pub logging: LoggingConfig,
    pub report: ReportConfig,
    pub timer: TimerConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Config {
    /// Load and validate the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), providers = config.providers.len(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration for this process.
    ///
    /// An explicit path must load. The environment variable and local file
    /// are best effort: a broken file there is logged and skipped.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "ICEPERF_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load(local) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(
                    path = %local.display(),
                    error = %e,
                    "local config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test.turn_duration_secs == 0 || self.test.stun_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "test durations must be greater than zero".into(),
            ));
        }
        if self.test.answerer_stun_url.trim().is_empty() {
            return Err(ConfigError::Invalid("test.answerer_stun_url is empty".into()));
        }
        if self.report.enabled && self.report.uri.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "report is enabled but report.uri is empty".into(),
            ));
        }
        if self.timer.enabled && self.timer.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "timer.interval_minutes must be greater than zero".into(),
            ));
        }
        for (name, provider) in self.enabled_providers() {
            provider
                .validate()
                .map_err(|reason| ConfigError::Invalid(format!("provider {name}: {reason}")))?;
        }
        Ok(())
    }

    /// Enabled providers in name order.
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, p)| p.enabled)
    }

    /// Point reporting at `uri`, enabling it. A `None` key keeps the
    /// configured one.
    pub fn override_report(&mut self, uri: String, api_key: Option<String>) {
        self.report.enabled = true;
        self.report.uri = uri;
        if let Some(key) = api_key {
            self.report.api_key = key;
        }
    }
}

// ---------------------------------------------------------------------------
// Test timing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Deadline for TURN/TURNS runs.
    pub turn_duration_secs: u64,
    /// Deadline for STUN/STUNS runs.
    pub stun_duration_secs: u64,
    /// Wait between closing the data channel and closing the peers.
    pub drain_grace_ms: u64,
    /// Non-relay STUN server for the answerer peer.
    pub answerer_stun_url: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            turn_duration_secs: 20,
            stun_duration_secs: 2,
            drain_grace_ms: 1000,
            answerer_stun_url: "stun:stun.l.google.com:19302".to_string(),
        }
    }
}

impl TestConfig {
    pub fn turn_duration(&self) -> Duration {
        Duration::from_secs(self.turn_duration_secs)
    }

    pub fn stun_duration(&self) -> Duration {
        Duration::from_secs(self.stun_duration_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Reporting and timer
// ---------------------------------------------------------------------------

/// Optional HTTPS sink for finished results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub uri: String,
    /// Sent as a bearer token.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 60,
        }
    }
}

impl TimerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// URIs built from host names and per-transport port lists.
    #[default]
    Generic,
    /// An explicit list of URIs.
    Static,
    Metered,
    Cloudflare,
    /// Twilio Tokens API, basic auth with `username`/`password`.
    Twilio,
    /// Xirsys `_turn` API, basic auth with `username`/`password`.
    Xirsys,
    /// Central API handing out servers for every provider.
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub kind: ProviderKind,
    pub username: String,
    pub password: String,
    pub api_key: String,
    pub request_url: String,
    pub stun_host: String,
    pub turn_host: String,
    /// Transport (`udp`, `tcp`, `tls`, `dtls`) to ports.
    pub stun_ports: BTreeMap<String, Vec<u16>>,
    pub turn_ports: BTreeMap<String, Vec<u16>>,
    pub stun_enabled: bool,
    pub turn_enabled: bool,
    pub do_throughput: bool,
    /// Emit bare `stun:host:port` URIs without a transport parameter.
    pub stun_use_rfc7094_uri: bool,
    pub urls: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ProviderKind::Generic,
            username: String::new(),
            password: String::new(),
            api_key: String::new(),
            request_url: String::new(),
            stun_host: String::new(),
            turn_host: String::new(),
            stun_ports: BTreeMap::new(),
            turn_ports: BTreeMap::new(),
            stun_enabled: true,
            turn_enabled: true,
            do_throughput: false,
            stun_use_rfc7094_uri: false,
            urls: Vec::new(),
        }
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), String> {
        match self.kind {
            ProviderKind::Generic => {
                if self.stun_host.is_empty() && self.turn_host.is_empty() {
                    return Err("generic provider needs stun_host or turn_host".into());
                }
            }
            ProviderKind::Static => {
                if self.urls.is_empty() {
                    return Err("static provider needs at least one url".into());
                }
            }
            ProviderKind::Metered | ProviderKind::Api => {
                if self.request_url.is_empty() {
                    return Err("request_url is required".into());
                }
            }
            ProviderKind::Twilio | ProviderKind::Xirsys => {
                if self.request_url.is_empty() {
                    return Err("request_url is required".into());
                }
                if self.username.is_empty() || self.password.is_empty() {
                    return Err("username and password are required for the http api".into());
                }
            }
            ProviderKind::Cloudflare => {
                if self.request_url.is_empty()
                    && self.stun_host.is_empty()
                    && self.turn_host.is_empty()
                {
                    return Err("cloudflare provider needs request_url or hosts".into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.test.turn_duration(), Duration::from_secs(20));
        assert_eq!(cfg.test.stun_duration(), Duration::from_secs(2));
        assert_eq!(cfg.test.drain_grace(), Duration::from_secs(1));
        assert_eq!(cfg.test.answerer_stun_url, "stun:stun.l.google.com:19302");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert!(!cfg.report.enabled);
        assert!(!cfg.timer.enabled);
        assert_eq!(cfg.timer.interval(), Duration::from_secs(3600));
        assert!(cfg.providers.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
node_id = "lon1"

[test]
turn_duration_secs = 10
drain_grace_ms = 250

[logging]
level = "debug"
format = "json"

[report]
enabled = true
uri = "https://api.example.com/insert"
api_key = "secret"

[providers.google]
enabled = true
stun_host = "stun.l.google.com"
stun_ports = { udp = [19302] }
turn_enabled = false

[providers.metered]
enabled = true
kind = "metered"
request_url = "https://example.metered.live/api/v1/turn/credentials"
api_key = "k"
do_throughput = true

[providers.disabled]
kind = "static"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.node_id, "lon1");
        assert_eq!(cfg.test.turn_duration_secs, 10);
        assert_eq!(cfg.test.stun_duration_secs, 2);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.report.enabled);

        let google = &cfg.providers["google"];
        assert_eq!(google.kind, ProviderKind::Generic);
        assert_eq!(google.stun_ports["udp"], vec![19302]);
        assert!(google.stun_enabled);
        assert!(!google.turn_enabled);

        assert_eq!(cfg.providers["metered"].kind, ProviderKind::Metered);
        let enabled: Vec<&String> = cfg.enabled_providers().map(|(name, _)| name).collect();
        assert_eq!(enabled, vec!["google", "metered"]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.test.stun_duration_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.report.enabled = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.providers.insert(
            "broken".into(),
            ProviderConfig {
                enabled: true,
                kind: ProviderKind::Static,
                ..Default::default()
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_credential_apis_need_basic_auth() {
        for kind in [ProviderKind::Twilio, ProviderKind::Xirsys] {
            let mut provider = ProviderConfig {
                enabled: true,
                kind,
                request_url: "https://api.example.com/turn".into(),
                username: "ident".into(),
                ..Default::default()
            };
            let mut cfg = Config::default();
            cfg.providers.insert("vendor".into(), provider.clone());
            assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))), "{kind:?}");

            provider.password = "secret".into();
            cfg.providers.insert("vendor".into(), provider);
            cfg.validate().unwrap();
        }

        let cfg: Config = toml::from_str(
            r#"
[providers.twilio]
kind = "twilio"
[providers.xirsys]
kind = "xirsys"
"#,
        )
        .unwrap();
        assert_eq!(cfg.providers["twilio"].kind, ProviderKind::Twilio);
        assert_eq!(cfg.providers["xirsys"].kind, ProviderKind::Xirsys);
    }

    #[test]
    fn test_override_report_enables_sink() {
        let mut cfg = Config::default();
        cfg.report.api_key = "configured".into();
        cfg.override_report("https://collector.example.com".into(), None);
        assert!(cfg.report.enabled);
        assert_eq!(cfg.report.api_key, "configured");
        cfg.validate().unwrap();
    }

    #[test]
    fn test_explicit_path_must_load() {
        let missing = Path::new("/nonexistent/iceperf.toml");
        assert!(matches!(
            Config::resolve(Some(missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_shipped_example_is_valid() {
        let cfg: Config = toml::from_str(include_str!("../iceperf.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.providers.len(), 8);
        let enabled: Vec<&String> = cfg.enabled_providers().map(|(name, _)| name).collect();
        assert_eq!(enabled, vec!["google"]);
        assert_eq!(cfg.providers["central"].kind, ProviderKind::Api);
    }
}
