use presence_mqtt::params::{default_client_id, DEFAULT_PORT, DEFAULT_TLS_PORT};
use presence_mqtt::{qos_from_level, ConnectionParams, QoS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Optional TOML base layer. Every key mirrors a `PRESENCE_*` variable.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub topic: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
    pub ca_cert: Option<PathBuf>,
    pub keepalive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub qos: Option<u8>,
    pub retain: Option<bool>,
    pub reference_dir: Option<PathBuf>,
    pub cache_filename: Option<String>,
    pub similarity_threshold: Option<f32>,
    pub model_dir: Option<PathBuf>,
    pub camera_device: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub intra_threads: Option<usize>,
    pub preview_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Broker session and publish settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Connection settings handed to the publish channel.
    pub connection: ConnectionParams,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
}

impl BrokerConfig {
    /// Broker settings alone, for tools that never touch the camera or models.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = load_layers()?;
        Self::resolve(&file, &env_lookup(|key| std::env::var(key).ok()))
    }

    fn resolve<F>(file: &FileConfig, var: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var("PRESENCE_BROKER_HOST")
            .or_else(|| file.broker_host.clone())
            .ok_or(ConfigError::Missing("PRESENCE_BROKER_HOST"))?;
        let topic = var("PRESENCE_TOPIC")
            .or_else(|| file.topic.clone())
            .ok_or(ConfigError::Missing("PRESENCE_TOPIC"))?;

        let use_tls = env_bool(var, "PRESENCE_TLS")?.or(file.tls).unwrap_or(true);
        let default_port = if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        let port = env_parse(var, "PRESENCE_BROKER_PORT")?
            .or(file.broker_port)
            .unwrap_or(default_port);

        let level = env_parse(var, "PRESENCE_QOS")?.or(file.qos).unwrap_or(1);
        let qos = qos_from_level(level).ok_or(ConfigError::Invalid {
            key: "PRESENCE_QOS",
            value: level.to_string(),
        })?;

        let mut connection = ConnectionParams::new(host, port);
        connection.client_id = var("PRESENCE_CLIENT_ID")
            .or_else(|| file.client_id.clone())
            .unwrap_or_else(default_client_id);
        connection.username = var("PRESENCE_USERNAME").or_else(|| file.username.clone());
        connection.password = var("PRESENCE_PASSWORD").or_else(|| file.password.clone());
        connection.use_tls = use_tls;
        connection.ca_cert = var("PRESENCE_CA_CERT")
            .map(PathBuf::from)
            .or_else(|| file.ca_cert.clone());
        connection.keepalive = Duration::from_secs(
            env_parse(var, "PRESENCE_KEEPALIVE_SECS")?
                .or(file.keepalive_secs)
                .unwrap_or(60),
        );
        connection.connect_timeout = Duration::from_secs(
            env_parse(var, "PRESENCE_CONNECT_TIMEOUT_SECS")?
                .or(file.connect_timeout_secs)
                .unwrap_or(5),
        );

        Ok(Self {
            connection,
            topic,
            qos,
            retain: env_bool(var, "PRESENCE_RETAIN")?.or(file.retain).unwrap_or(false),
        })
    }
}

/// Daemon configuration: TOML base layer, overridden by environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    /// Directory of reference photos of the target person.
    pub reference_dir: PathBuf,
    /// Cache file name inside `reference_dir`.
    pub cache_filename: String,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Where the annotated frame is written after every iteration, if set.
    pub preview_path: Option<PathBuf>,
}

impl Config {
    /// Load `.env`, the optional `PRESENCE_CONFIG` file, then `PRESENCE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = load_layers()?;
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a file layer with a variable lookup.
    pub fn resolve<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = env_lookup(lookup);
        let broker = BrokerConfig::resolve(&file, &var)?;

        let reference_dir = var("PRESENCE_REFERENCE_DIR")
            .map(PathBuf::from)
            .or(file.reference_dir)
            .ok_or(ConfigError::Missing("PRESENCE_REFERENCE_DIR"))?;

        let similarity_threshold = env_parse(&var, "PRESENCE_SIMILARITY_THRESHOLD")?
            .or(file.similarity_threshold)
            .unwrap_or(presence_core::DEFAULT_SIMILARITY_THRESHOLD);
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::Invalid {
                key: "PRESENCE_SIMILARITY_THRESHOLD",
                value: similarity_threshold.to_string(),
            });
        }

        let intra_threads = env_parse(&var, "PRESENCE_INTRA_THREADS")?
            .or(file.intra_threads)
            .unwrap_or(2);
        if intra_threads == 0 {
            return Err(ConfigError::Invalid {
                key: "PRESENCE_INTRA_THREADS",
                value: "0".into(),
            });
        }

        Ok(Self {
            broker,
            reference_dir,
            cache_filename: var("PRESENCE_CACHE_FILENAME")
                .or(file.cache_filename)
                .unwrap_or_else(|| presence_core::DEFAULT_CACHE_FILENAME.to_string()),
            similarity_threshold,
            model_dir: var("PRESENCE_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(presence_core::default_model_dir),
            camera_device: var("PRESENCE_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_parse(&var, "PRESENCE_FRAME_WIDTH")?
                .or(file.frame_width)
                .unwrap_or(640),
            frame_height: env_parse(&var, "PRESENCE_FRAME_HEIGHT")?
                .or(file.frame_height)
                .unwrap_or(480),
            intra_threads,
            preview_path: var("PRESENCE_PREVIEW_PATH")
                .map(PathBuf::from)
                .or(file.preview_path),
        })
    }
}

/// `.env` first, then the TOML file named by `PRESENCE_CONFIG`, if any.
fn load_layers() -> Result<FileConfig, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
    match std::env::var_os("PRESENCE_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            tracing::info!(path = %path.display(), "loading config file");
            FileConfig::load(&path)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Empty variables count as unset.
fn env_lookup<F>(lookup: F) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    move |key: &str| lookup(key).filter(|v| !v.trim().is_empty())
}

fn env_parse<T, F>(var: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: v })
        })
        .transpose()
}

fn env_bool<F>(var: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: v }),
        })
        .transpose()
}
