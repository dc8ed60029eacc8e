//! Process configuration model, defaults, environment overrides and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;

use crate::error::ConfigError;
use crate::sampler::{MAX_DECAY, MIN_DECAY};

pub const CONFIG_FILE_NAME: &str = "photocast.toml";
pub const CONFIG_PATH_ENV: &str = "PHOTOCAST_CONFIG";
/// Written when no config file exists yet.
pub const CONFIG_TEMPLATE: &str = include_str!("../config/photocast.toml");

/// Root configuration read from `photocast.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Which receiver to drive and how to recognise its states.
    pub device: DeviceConfig,
    #[serde(default)]
    /// Where photos come from.
    pub source: SourceConfig,
    #[serde(default)]
    /// Recency weighting and album filtering.
    pub selection: SelectionConfig,
    #[serde(default)]
    /// Poll, display, retry and cache intervals.
    pub timing: TimingConfig,
    #[serde(default)]
    /// Embedded file server used with a local photo folder.
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DeviceConfig {
    /// Friendly name the receiver announces over mDNS.
    #[serde(default)]
    pub name: String,
    /// Skips mDNS discovery when set.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_cast_port")]
    pub port: u16,
    #[serde(default = "default_idle_identity")]
    pub idle_identity: String,
    #[serde(default = "default_content_identity")]
    pub content_identity: String,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Immich,
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub immich_base_url: String,
    #[serde(default)]
    pub immich_api_key: String,
    /// Folder whose year-named subfolders are served as albums.
    #[serde(default)]
    pub local_root: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SelectionConfig {
    /// Relative weight gain per year, in `[1.0, 2.0]`.
    #[serde(default = "default_decay")]
    pub decay: f64,
    /// Albums and files whose names contain any of these (case-insensitive)
    /// are never shown.
    #[serde(default)]
    pub exclusions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_poll_backoff_secs")]
    pub poll_backoff_secs: u64,
    #[serde(default = "default_display_interval_secs")]
    pub display_interval_secs: u64,
    #[serde(default = "default_index_ttl_secs")]
    pub index_ttl_secs: u64,
    #[serde(default = "default_listing_ttl_secs")]
    pub bucket_listing_ttl_secs: u64,
    #[serde(default = "default_listing_ttl_secs")]
    pub asset_listing_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Fixed so photo URLs stay recognisable across restarts; `0` picks a free
    /// port.
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Host put into photo URLs; defaults to the interface facing the receiver.
    #[serde(default)]
    pub public_host: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: None,
            port: default_cast_port(),
            idle_identity: default_idle_identity(),
            content_identity: default_content_identity(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            decay: default_decay(),
            exclusions: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval_secs(),
            poll_backoff_secs: default_poll_backoff_secs(),
            display_interval_secs: default_display_interval_secs(),
            index_ttl_secs: default_index_ttl_secs(),
            bucket_listing_ttl_secs: default_listing_ttl_secs(),
            asset_listing_ttl_secs: default_listing_ttl_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_server_port(),
            public_host: None,
        }
    }
}

impl TimingConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_secs(self.poll_backoff_secs)
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_secs(self.display_interval_secs)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }

    pub fn bucket_listing_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_listing_ttl_secs)
    }

    pub fn asset_listing_ttl(&self) -> Duration {
        Duration::from_secs(self.asset_listing_ttl_secs)
    }
}

fn default_server_port() -> u16 {
    8123
}

fn default_cast_port() -> u16 {
    8009
}

fn default_idle_identity() -> String {
    "Backdrop".to_string()
}

fn default_content_identity() -> String {
    "Default Media Receiver".to_string()
}

fn default_decay() -> f64 {
    1.5
}

fn default_retry_interval_secs() -> u64 {
    22
}

fn default_poll_backoff_secs() -> u64 {
    27
}

fn default_display_interval_secs() -> u64 {
    60
}

fn default_index_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_listing_ttl_secs() -> u64 {
    60 * 60
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(field, format!("cannot parse '{raw}'")))
}

impl Config {
    /// Applies environment overrides; `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(name) = lookup("CHROMECAST_NAME") {
            self.device.name = name;
        }
        if let Some(base_url) = lookup("IMMICH_BASE_URL") {
            self.source.immich_base_url = base_url;
        }
        if let Some(api_key) = lookup("IMMICH_API_KEY") {
            self.source.immich_api_key = api_key;
        }
        if let Some(exclusions) = lookup("ALBUM_SUBSTR_BLACKLIST") {
            self.selection.exclusions = exclusions
                .split(';')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(decay) = lookup("YEAR_DECAY_FACTOR") {
            self.selection.decay = parse_env("YEAR_DECAY_FACTOR", &decay)?;
        }
        if let Some(interval) = lookup("PHOTO_INTERVAL_SECS") {
            self.timing.display_interval_secs = parse_env("PHOTO_INTERVAL_SECS", &interval)?;
        }
        Ok(())
    }

    /// Rejects values the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.trim().is_empty() {
            return Err(invalid(
                "device.name",
                "set the receiver's friendly name (or CHROMECAST_NAME)",
            ));
        }
        if self.device.idle_identity.trim().is_empty() {
            return Err(invalid("device.idle_identity", "must not be empty"));
        }
        if self.device.content_identity.trim().is_empty() {
            return Err(invalid("device.content_identity", "must not be empty"));
        }

        match self.source.kind {
            SourceKind::Immich => {
                let base_url = self.source.immich_base_url.trim();
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                    return Err(invalid(
                        "source.immich_base_url",
                        "must be an http(s) URL (or set IMMICH_BASE_URL)",
                    ));
                }
                if self.source.immich_api_key.trim().is_empty() {
                    return Err(invalid(
                        "source.immich_api_key",
                        "must not be empty (or set IMMICH_API_KEY)",
                    ));
                }
            }
            SourceKind::Local => {
                if !Path::new(&self.source.local_root).is_dir() {
                    return Err(invalid(
                        "source.local_root",
                        format!("'{}' is not a directory", self.source.local_root),
                    ));
                }
            }
        }

        let decay = self.selection.decay;
        if !decay.is_finite() || !(MIN_DECAY..=MAX_DECAY).contains(&decay) {
            return Err(invalid(
                "selection.decay",
                format!("{decay} is outside [{MIN_DECAY}, {MAX_DECAY}]"),
            ));
        }

        let timing = &self.timing;
        for (field, value) in [
            ("timing.retry_interval_secs", timing.retry_interval_secs),
            ("timing.poll_backoff_secs", timing.poll_backoff_secs),
            ("timing.display_interval_secs", timing.display_interval_secs),
            ("timing.index_ttl_secs", timing.index_ttl_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        for (field, value) in [
            ("timing.bucket_listing_ttl_secs", timing.bucket_listing_ttl_secs),
            ("timing.asset_listing_ttl_secs", timing.asset_listing_ttl_secs),
        ] {
            if value > timing.index_ttl_secs {
                return Err(invalid(
                    field,
                    format!("must not exceed timing.index_ttl_secs ({})", timing.index_ttl_secs),
                ));
            }
        }
        Ok(())
    }
}

/// First CLI argument, else `PHOTOCAST_CONFIG`, else the user config dir.
pub fn resolve_config_path(
    cli_arg: Option<String>,
    env_value: Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = cli_arg.or(env_value).filter(|value| !value.trim().is_empty()) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or_else(|| invalid("config path", "no user config directory; pass a path"))
}

/// Reads `path`, writing the default template first when it does not exist.
pub fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, CONFIG_TEMPLATE).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Reads, overrides from the environment and validates.
pub fn load_config(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = read_config_file(path)?;
    config.apply_env_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        load_config, read_config_file, resolve_config_path, Config, SourceKind, CONFIG_TEMPLATE,
    };
    use crate::error::ConfigError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.device.name = "Living Room TV".to_string();
        config.source.immich_base_url = "https://photos.example.com".to_string();
        config.source.immich_api_key = "secret".to_string();
        config
    }

    fn invalid_field(result: Result<(), ConfigError>) -> &'static str {
        match result {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();

        assert!(config.device.name.is_empty());
        assert_eq!(config.device.host, None);
        assert_eq!(config.device.port, 8009);
        assert_eq!(config.device.idle_identity, "Backdrop");
        assert_eq!(config.device.content_identity, "Default Media Receiver");
        assert_eq!(config.source.kind, SourceKind::Immich);
        assert!((config.selection.decay - 1.5).abs() < f64::EPSILON);
        assert!(config.selection.exclusions.is_empty());
        assert_eq!(config.timing.retry_interval_secs, 22);
        assert_eq!(config.timing.poll_backoff_secs, 27);
        assert_eq!(config.timing.display_interval_secs, 60);
        assert_eq!(config.timing.index_ttl_secs, 7200);
        assert_eq!(config.timing.bucket_listing_ttl_secs, 3600);
        assert_eq!(config.timing.asset_listing_ttl_secs, 3600);
        assert_eq!(config.server.bind_host, "0.0.0.0");
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server.public_host, None);
    }

    #[test]
    fn test_config_template_matches_default_values() {
        let parsed: Config = toml::from_str(CONFIG_TEMPLATE).expect("template should parse");
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[device]
name = "Den"
host = "192.168.1.77"

[source]
kind = "local"
local_root = "/srv/photos"

[selection]
exclusions = ["private", "screenshots"]
"#,
        )
        .expect("config should parse");

        assert_eq!(parsed.device.name, "Den");
        assert_eq!(parsed.device.host.as_deref(), Some("192.168.1.77"));
        assert_eq!(parsed.device.port, 8009);
        assert_eq!(parsed.source.kind, SourceKind::Local);
        assert_eq!(parsed.selection.exclusions, vec!["private", "screenshots"]);
        assert!((parsed.selection.decay - 1.5).abs() < f64::EPSILON);
        assert_eq!(parsed.timing.poll_backoff_secs, 27);
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = valid_config();
        config
            .apply_env_overrides(env(&[
                ("CHROMECAST_NAME", "Kitchen"),
                ("IMMICH_API_KEY", "from-env"),
                ("ALBUM_SUBSTR_BLACKLIST", "private; ;Screenshots"),
                ("YEAR_DECAY_FACTOR", "1.25"),
                ("PHOTO_INTERVAL_SECS", "45"),
            ]))
            .expect("overrides should apply");

        assert_eq!(config.device.name, "Kitchen");
        assert_eq!(config.source.immich_api_key, "from-env");
        assert_eq!(config.source.immich_base_url, "https://photos.example.com");
        assert_eq!(config.selection.exclusions, vec!["private", "Screenshots"]);
        assert!((config.selection.decay - 1.25).abs() < f64::EPSILON);
        assert_eq!(config.timing.display_interval_secs, 45);
    }

    #[test]
    fn test_unparsable_env_override_is_invalid() {
        let mut config = valid_config();
        let result = config.apply_env_overrides(env(&[("YEAR_DECAY_FACTOR", "steep")]));
        assert_eq!(invalid_field(result), "YEAR_DECAY_FACTOR");
    }

    #[test]
    fn test_validate_rejects_out_of_range_decay() {
        valid_config().validate().expect("baseline should be valid");
        for decay in [0.99, 2.01, f64::NAN] {
            let mut config = valid_config();
            config.selection.decay = decay;
            assert_eq!(invalid_field(config.validate()), "selection.decay");
        }
        for decay in [1.0, 2.0] {
            let mut config = valid_config();
            config.selection.decay = decay;
            config.validate().expect("bounds are inclusive");
        }
    }

    #[test]
    fn test_validate_rejects_missing_identity_and_credentials() {
        let mut config = valid_config();
        config.device.name = "  ".to_string();
        assert_eq!(invalid_field(config.validate()), "device.name");

        let mut config = valid_config();
        config.source.immich_base_url = "photos.example.com".to_string();
        assert_eq!(invalid_field(config.validate()), "source.immich_base_url");

        let mut config = valid_config();
        config.source.immich_api_key.clear();
        assert_eq!(invalid_field(config.validate()), "source.immich_api_key");

        let mut config = valid_config();
        config.source.kind = SourceKind::Local;
        config.source.local_root = "/definitely/not/here".to_string();
        assert_eq!(invalid_field(config.validate()), "source.local_root");
    }

    #[test]
    fn test_validate_rejects_bad_intervals() {
        let mut config = valid_config();
        config.timing.display_interval_secs = 0;
        assert_eq!(invalid_field(config.validate()), "timing.display_interval_secs");

        let mut config = valid_config();
        config.timing.asset_listing_ttl_secs = config.timing.index_ttl_secs + 1;
        assert_eq!(invalid_field(config.validate()), "timing.asset_listing_ttl_secs");
    }

    #[test]
    fn test_missing_file_gets_template_then_fails_validation() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested/photocast.toml");

        let result = load_config(&path, env(&[]));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "device.name",
                ..
            })
        ));
        assert_eq!(
            std::fs::read_to_string(&path).expect("template should be written"),
            CONFIG_TEMPLATE
        );
        assert_eq!(
            read_config_file(&path).expect("template should parse"),
            Config::default()
        );
    }

    #[test]
    fn test_load_config_with_env_secrets() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("photocast.toml");
        std::fs::write(&path, "[device]\nname = \"Den\"\n").expect("config should be written");

        let config = load_config(
            &path,
            env(&[
                ("IMMICH_BASE_URL", "https://photos.example.com"),
                ("IMMICH_API_KEY", "k"),
            ]),
        )
        .expect("config should load");
        assert_eq!(config.device.name, "Den");
        assert_eq!(config.source.immich_api_key, "k");
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("photocast.toml");
        std::fs::write(&path, "[device\nname = ").expect("config should be written");
        assert!(matches!(
            read_config_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_path_precedence() {
        assert_eq!(
            resolve_config_path(Some("a.toml".to_string()), Some("b.toml".to_string()))
                .expect("path"),
            std::path::PathBuf::from("a.toml")
        );
        assert_eq!(
            resolve_config_path(None, Some("b.toml".to_string())).expect("path"),
            std::path::PathBuf::from("b.toml")
        );
    }
}
