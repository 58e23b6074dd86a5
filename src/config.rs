use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which pub/sub backend carries chat events between ingest and fan-out.
#[derive(clap::ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process topic, single node only
    Memory,
    /// External nsqd over its TCP protocol
    Nsq,
}

/// Turbo chat delivery server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "turbo-server", version, about = "Turbo real-time chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "TURBO_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "TURBO_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./turbo.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "TURBO_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, signing key)
    #[arg(long, env = "TURBO_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// HS256 signing secret for locally issued tokens.
    /// Empty means a random key is loaded from (or generated into) data_dir.
    #[arg(long, env = "TURBO_JWT_SECRET", default_value = "")]
    pub jwt_secret: String,

    /// Base URL of the remote auth/storage provider. Tokens are checked
    /// against {auth_url}/auth/v1/user before local verification.
    #[arg(long, env = "TURBO_AUTH_URL")]
    pub auth_url: Option<String>,

    /// API key sent as the `apikey` header to the remote auth provider
    #[arg(long, env = "TURBO_AUTH_API_KEY")]
    pub auth_api_key: Option<String>,

    /// Service key used by cleanup jobs against the storage API
    #[arg(long, env = "TURBO_STORAGE_SERVICE_KEY")]
    pub storage_service_key: Option<String>,

    /// Broker backend
    #[arg(long, env = "TURBO_BROKER", value_enum, default_value = "memory")]
    pub broker: BrokerKind,

    /// nsqd TCP address (broker = "nsq")
    #[arg(long, env = "TURBO_NSQD_ADDRESS", default_value = "127.0.0.1:4150")]
    pub nsqd_address: String,

    /// Topic chat events are published to
    #[arg(long, env = "TURBO_TOPIC", default_value = "chat")]
    pub topic: String,

    /// NSQ channel this process consumes the topic through
    #[arg(long, env = "TURBO_CHANNEL", default_value = "channel_turbo")]
    pub channel: String,

    /// Per-connection outbound queue depth; a full queue drops broadcasts to that client
    #[arg(long, env = "TURBO_OUTBOUND_QUEUE", default_value = "256")]
    pub outbound_queue: usize,

    /// Close connections that send no frames for this many seconds (disabled when unset)
    #[arg(long, env = "TURBO_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Number of cleanup workers
    #[arg(long, env = "TURBO_CLEANUP_WORKERS", default_value = "2")]
    pub cleanup_workers: usize,

    /// Cleanup queue capacity; submissions beyond it are rejected
    #[arg(long, env = "TURBO_CLEANUP_QUEUE", default_value = "64")]
    pub cleanup_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./turbo.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            jwt_secret: String::new(),
            auth_url: None,
            auth_api_key: None,
            storage_service_key: None,
            broker: BrokerKind::Memory,
            nsqd_address: "127.0.0.1:4150".to_string(),
            topic: "chat".to_string(),
            channel: "channel_turbo".to_string(),
            outbound_queue: 256,
            idle_timeout_secs: None,
            cleanup_workers: 2,
            cleanup_queue: 64,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (TURBO_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_matches(&Config::command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self, figment::Error> {
        let cli = Config::from_arg_matches(matches).map_err(|e| figment::Error::from(e.to_string()))?;
        Self::figment(&cli, explicit_args(matches, &cli)).extract()
    }

    fn figment(cli: &Config, explicit: Map<String, Value>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("TURBO_"))
            .merge(Serialized::defaults(explicit))
    }

    /// Remote auth base URL with any trailing slash removed.
    pub fn auth_base(&self) -> Option<&str> {
        self.auth_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
    }
}

/// Only the values typed on the command line. clap fills every other field
/// with its default, which must not shadow the file or the environment.
fn explicit_args(matches: &ArgMatches, cli: &Config) -> Map<String, Value> {
    let Ok(Value::Object(all)) = serde_json::to_value(cli) else {
        return Map::new();
    };
    all.into_iter()
        .filter(|(key, _)| {
            matches!(
                matches.value_source(key),
                Some(ValueSource::CommandLine)
            )
        })
        .collect()
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Turbo Chat Server Configuration
# Place this file at ./turbo.toml or specify with --config <path>
# All settings can be overridden via environment variables (TURBO_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and generated signing key
# data_dir = "./data"

# HS256 secret for locally issued tokens. Leave empty to use a generated key.
# jwt_secret = ""

# ---- Remote auth / storage provider ----
# Tokens are validated against {auth_url}/auth/v1/user first and fall back to
# local verification when that call fails.
# auth_url = "https://project.example.co"
# auth_api_key = ""
# storage_service_key = ""

# ---- Broker ----
# "memory" keeps fan-out inside this process; "nsq" publishes through nsqd.
# broker = "memory"
# nsqd_address = "127.0.0.1:4150"
# topic = "chat"
# channel = "channel_turbo"

# ---- Connections ----
# Outbound frames queued per client before broadcasts to it are dropped
# outbound_queue = 256

# Disconnect clients that send nothing for this long (disabled by default)
# idle_timeout_secs = 300

# ---- Cleanup workers (superseded avatar deletion) ----
# cleanup_workers = 2
# cleanup_queue = 64
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        Config::command()
            .try_get_matches_from(std::iter::once("turbo-server").chain(args.iter().copied()))
            .unwrap()
    }

    fn write_toml(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("turbo.toml");
        std::fs::write(&path, body).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_defaults_extract_without_file() {
        let config = Config::from_matches(&matches(&["--config", "/nonexistent/turbo.toml"])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.broker, BrokerKind::Memory);
        assert_eq!(config.topic, "chat");
        assert!(config.idle_timeout_secs.is_none());
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "port = 9999\nbroker = \"nsq\"\ntopic = \"room\"\nidle_timeout_secs = 120\n",
        );

        let config = Config::from_matches(&matches(&["--config", &path])).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.broker, BrokerKind::Nsq);
        assert_eq!(config.topic, "room");
        assert_eq!(config.idle_timeout_secs, Some(120));
        assert_eq!(config.config, path);
    }

    #[test]
    fn test_explicit_cli_flags_override_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "port = 9999\nbroker = \"nsq\"\n");

        let config = Config::from_matches(&matches(&[
            "--config",
            &path,
            "--port",
            "7000",
            "--json-logs",
        ]))
        .unwrap();
        assert_eq!(config.port, 7000);
        assert!(config.json_logs);
        // Not given on the command line, so the file still wins.
        assert_eq!(config.broker, BrokerKind::Nsq);
    }

    #[test]
    fn test_auth_base_trims_trailing_slash() {
        let config = Config {
            auth_url: Some("https://auth.example.co/".to_string()),
            ..Config::default()
        };
        assert_eq!(config.auth_base(), Some("https://auth.example.co"));

        let empty = Config {
            auth_url: Some(String::new()),
            ..Config::default()
        };
        assert_eq!(empty.auth_base(), None);
    }

    #[test]
    fn test_template_mentions_every_section() {
        let template = generate_config_template();
        assert!(template.contains("broker"));
        assert!(template.contains("idle_timeout_secs"));
        assert!(template.contains("cleanup_workers"));
    }
}
