use crate::error::AppError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::Path};

/// Measurement used when a device does not override it.
pub const DEFAULT_MEASUREMENT: &str = "shelly_em";
/// Tag identifying a device in storage; the watermark query filters on it.
pub const DEVICE_TAG: &str = "device_name";
pub const MIN_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sync: SyncConfig,
    pub devices: Vec<DeviceEndpoint>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between successful cycles, at least 60.
    pub interval_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_storage_retry_secs")]
    pub storage_retry_secs: u64,
}

fn default_max_backoff_secs() -> u64 {
    900
}
fn default_page_delay_ms() -> u64 {
    250
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_storage_retry_secs() -> u64 {
    10
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn storage_retry(&self) -> Duration {
        Duration::from_secs(self.storage_retry_secs)
    }
}

/// One metering device as configured. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Either a mapping or an inline "key=value,key2=value2" string.
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub measurement: Option<String>,
}

impl DeviceEndpoint {
    pub fn measurement(&self) -> &str {
        self.measurement.as_deref().unwrap_or(DEFAULT_MEASUREMENT)
    }

    pub fn device_name(&self) -> &str {
        self.tags
            .get(DEVICE_TAG)
            .map(String::as_str)
            .unwrap_or(&self.host)
    }

    /// Basic-auth pair, only when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagsRepr {
    Map(BTreeMap<String, String>),
    Inline(String),
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<TagsRepr>::deserialize(deserializer)? {
        None => BTreeMap::new(),
        Some(TagsRepr::Map(map)) => map,
        Some(TagsRepr::Inline(raw)) => parse_inline_tags(&raw),
    })
}

/// Parse "key=value,key2=value2". Pairs missing either side are ignored.
pub fn parse_inline_tags(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Storage backend selection, discriminated by `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawStorageConfig", into = "RawStorageConfig")]
pub enum StorageConfig {
    V1(InfluxV1Config),
    V2(InfluxV2Config),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfluxV1Config {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl InfluxV1Config {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfluxV2Config {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Flat on-disk shape; validated into [`StorageConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawStorageConfig {
    version: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
}

fn required(value: Option<String>, message: &str) -> Result<String, String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| message.to_string())
}

impl TryFrom<RawStorageConfig> for StorageConfig {
    type Error = String;

    fn try_from(raw: RawStorageConfig) -> Result<Self, Self::Error> {
        match raw.version {
            Some(1) => {
                let host = required(raw.host, "InfluxDB v1 host is required")?;
                let database = required(raw.database, "InfluxDB v1 database is required")?;
                match (&raw.username, &raw.password) {
                    (Some(_), None) => {
                        return Err("InfluxDB v1 password is required when username is set".into())
                    }
                    (None, Some(_)) => {
                        return Err("InfluxDB v1 username is required when password is set".into())
                    }
                    _ => {}
                }
                Ok(StorageConfig::V1(InfluxV1Config {
                    host,
                    port: raw.port.unwrap_or(8086),
                    database,
                    username: raw.username,
                    password: raw.password,
                }))
            }
            Some(2) => {
                let url = required(raw.url, "InfluxDB v2 url is required")?;
                let token = required(raw.token, "InfluxDB v2 token is required")?;
                let org = required(raw.org, "InfluxDB v2 org is required")?;
                let bucket = required(raw.bucket, "InfluxDB v2 bucket is required")?;
                reqwest::Url::parse(&url).map_err(|_| "InfluxDB v2 url is invalid".to_string())?;
                Ok(StorageConfig::V2(InfluxV2Config {
                    url,
                    token,
                    org,
                    bucket,
                }))
            }
            Some(other) => Err(format!("Invalid InfluxDB version: {}", other)),
            None => Err("InfluxDB version is required".into()),
        }
    }
}

impl From<StorageConfig> for RawStorageConfig {
    fn from(cfg: StorageConfig) -> Self {
        match cfg {
            StorageConfig::V1(v1) => RawStorageConfig {
                version: Some(1),
                host: Some(v1.host),
                port: Some(v1.port),
                database: Some(v1.database),
                username: v1.username,
                password: v1.password,
                ..Default::default()
            },
            StorageConfig::V2(v2) => RawStorageConfig {
                version: Some(2),
                url: Some(v2.url),
                token: Some(v2.token),
                org: Some(v2.org),
                bucket: Some(v2.bucket),
                ..Default::default()
            },
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, or from a directory holding
    /// `default.yaml` and `<APP_ENV>.yaml` (environment file wins per top-level key).
    /// `$(VAR)`/`${VAR}` placeholders are substituted from the environment first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let merged = if path.is_dir() {
            let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".into());
            let layers = [
                path.join("default.yaml"),
                path.join(format!("{}.yaml", env)),
            ];
            let mut merged: Option<Mapping> = None;
            for layer in &layers {
                if let Some(map) = read_layer(layer)? {
                    let base = merged.get_or_insert_with(Mapping::new);
                    for (k, v) in map {
                        base.insert(k, v);
                    }
                }
            }
            merged.ok_or_else(|| {
                AppError::Config(format!("no configuration found in {}", path.display()))
            })?
        } else {
            read_layer(path)?.ok_or_else(|| {
                AppError::Config(format!("config file {} does not exist", path.display()))
            })?
        };
        Self::from_value(Value::Mapping(merged))
    }

    /// Parse and validate a YAML document (placeholders are expanded).
    pub fn from_yaml_str(raw: &str) -> Result<Self, AppError> {
        let expanded = expand_env_placeholders(raw)?;
        let value: Value = serde_yaml::from_str(&expanded)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, AppError> {
        let mut cfg: Self =
            serde_yaml::from_value(value).map_err(|e| AppError::Config(e.to_string()))?;
        cfg.fill_device_names();
        cfg.validate()?;
        Ok(cfg)
    }

    fn fill_device_names(&mut self) {
        for device in &mut self.devices {
            if !device.tags.contains_key(DEVICE_TAG) {
                device
                    .tags
                    .insert(DEVICE_TAG.to_string(), device.host.clone());
            }
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.devices.is_empty() {
            return Err(AppError::Config(
                "At least one device configuration is required".into(),
            ));
        }
        for (index, device) in self.devices.iter().enumerate() {
            if device.host.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "Device host is required for device at index {}",
                    index
                )));
            }
            if device.password.is_some() && device.username.is_none() {
                return Err(AppError::Config(format!(
                    "Device username is required when password is set for device at index {}",
                    index
                )));
            }
        }
        if self.sync.interval_secs < MIN_INTERVAL_SECS {
            return Err(AppError::Config(format!(
                "sync.interval_secs must be at least {} seconds",
                MIN_INTERVAL_SECS
            )));
        }
        Ok(())
    }
}

/// Read one YAML layer. Missing files yield `None`; an empty document is an empty mapping.
fn read_layer(path: &Path) -> Result<Option<Mapping>, AppError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to load config from {}: {}", path.display(), e))
    })?;
    let expanded = expand_env_placeholders(&raw)?;
    match serde_yaml::from_str::<Value>(&expanded) {
        Ok(Value::Mapping(map)) => Ok(Some(map)),
        Ok(Value::Null) => Ok(Some(Mapping::new())),
        Ok(_) => Err(AppError::Config(format!(
            "{} must contain a mapping at the top level",
            path.display()
        ))),
        Err(e) => Err(AppError::Config(format!(
            "Failed to load config from {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" is an escaped literal "$"; any other "$" is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String, AppError> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let mut var = String::new();
        let mut terminated = false;
        for ch in it.by_ref() {
            if ch == close {
                terminated = true;
                break;
            }
            var.push(ch);
        }
        if !terminated {
            return Err(AppError::Config(format!(
                "unterminated env placeholder: missing '{}'",
                close
            )));
        }
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {}", var)))?;
        out.push_str(&val);
    }

    Ok(out)
}
