//! Configuration module for oneshot-httpd.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Readiness delivery mode for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Level,
    Edge,
}

impl TriggerMode {
    pub fn is_edge(self) -> bool {
        self == TriggerMode::Edge
    }

    /// Decode the compact `--trig-mode` value into (listen, conn) modes.
    pub fn from_code(code: u8) -> (TriggerMode, TriggerMode) {
        use TriggerMode::{Edge, Level};
        match code {
            0 => (Level, Level),
            1 => (Level, Edge),
            2 => (Edge, Level),
            _ => (Edge, Edge),
        }
    }
}

/// Application protocol served on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Http,
    Echo,
    Ping,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "oneshot-httpd")]
#[command(version)]
#[command(about = "A multi-threaded epoll web server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1316)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Trigger modes as one code: 0 = LT/LT, 1 = conn ET, 2 = listen ET, 3 = both ET
    #[arg(long)]
    pub trig_mode: Option<u8>,

    /// Trigger mode of the listening socket
    #[arg(long, value_enum)]
    pub listen_trigger: Option<TriggerMode>,

    /// Trigger mode of connection sockets
    #[arg(long, value_enum)]
    pub conn_trigger: Option<TriggerMode>,

    /// Register connections without EPOLLONESHOT and emulate it instead
    #[arg(long)]
    pub no_oneshot: bool,

    /// Idle timeout in milliseconds (0 or negative disables eviction)
    #[arg(short = 't', long, allow_negative_numbers = true)]
    pub timeout_ms: Option<i64>,

    /// Enable SO_LINGER with a one second timeout
    #[arg(long)]
    pub linger: bool,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum events returned by one reactor wait
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Initial per-connection buffer capacity in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Protocol to serve
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Document root for the http protocol
    #[arg(long)]
    pub docroot: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    pub oneshot: bool,
    pub timeout_ms: i64,
    pub linger: bool,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_events: usize,
    pub buffer_size: usize,
    pub protocol: ProtocolType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1316".to_string(),
            listen_trigger: TriggerMode::Edge,
            conn_trigger: TriggerMode::Edge,
            oneshot: true,
            timeout_ms: 60_000,
            linger: false,
            backlog: 1024,
            workers: None,
            max_connections: 65536,
            max_events: 1024,
            buffer_size: 1024,
            protocol: ProtocolType::Http,
        }
    }
}

/// HTTP protocol configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub docroot: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            docroot: PathBuf::from("./resources"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    pub oneshot: bool,
    /// Idle timeout; non-positive disables eviction.
    pub timeout_ms: i64,
    pub linger: bool,
    pub backlog: i32,
    pub workers: usize,
    pub max_connections: usize,
    pub max_events: usize,
    pub buffer_size: usize,
    pub protocol: ProtocolType,
    pub docroot: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over file values.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let server = file.server;

        let listen_str = cli.listen.unwrap_or(server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|source| ConfigError::InvalidListen {
                addr: listen_str.clone(),
                source,
            })?;

        let (code_listen, code_conn) = match cli.trig_mode {
            Some(code) => {
                let (l, c) = TriggerMode::from_code(code);
                (Some(l), Some(c))
            }
            None => (None, None),
        };

        let workers = cli
            .workers
            .or(server.workers)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        Ok(Config {
            listen,
            listen_trigger: cli
                .listen_trigger
                .or(code_listen)
                .unwrap_or(server.listen_trigger),
            conn_trigger: cli
                .conn_trigger
                .or(code_conn)
                .unwrap_or(server.conn_trigger),
            oneshot: server.oneshot && !cli.no_oneshot,
            timeout_ms: cli.timeout_ms.unwrap_or(server.timeout_ms),
            linger: cli.linger || server.linger,
            backlog: cli.backlog.unwrap_or(server.backlog),
            workers,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            max_events: cli.max_events.unwrap_or(server.max_events).max(1),
            buffer_size: cli.buffer_size.unwrap_or(server.buffer_size).max(1),
            protocol: cli.protocol.unwrap_or(server.protocol),
            docroot: cli.docroot.unwrap_or(file.http.docroot),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["oneshot-httpd"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:1316".parse().unwrap());
        assert_eq!(config.listen_trigger, TriggerMode::Edge);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
        assert!(config.oneshot);
        assert_eq!(config.timeout_ms, 60_000);
        assert!(!config.linger);
        assert_eq!(config.backlog, 1024);
        assert!(config.workers >= 1);
        assert_eq!(config.max_connections, 65536);
        assert_eq!(config.max_events, 1024);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.protocol, ProtocolType::Http);
        assert_eq!(config.docroot, PathBuf::from("./resources"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:8080"
            listen_trigger = "level"
            oneshot = false
            timeout_ms = -1
            linger = true
            workers = 4
            protocol = "echo"

            [http]
            docroot = "/srv/www"

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(file.server.listen_trigger, TriggerMode::Level);
        assert_eq!(file.server.conn_trigger, TriggerMode::Edge);
        assert_eq!(file.server.workers, Some(4));

        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert!(!config.oneshot);
        assert_eq!(config.timeout_ms, -1);
        assert!(config.linger);
        assert_eq!(config.workers, 4);
        assert_eq!(config.protocol, ProtocolType::Echo);
        assert_eq!(config.docroot, PathBuf::from("/srv/www"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:8080"
            timeout_ms = 1000
            workers = 4
            "#,
        )
        .unwrap();

        let args = cli(&[
            "-l",
            "127.0.0.1:9090",
            "-t",
            "-5",
            "-w",
            "2",
            "-p",
            "ping",
            "--no-oneshot",
            "--log-level",
            "trace",
        ]);
        let config = Config::merge(args, file).unwrap();
        assert_eq!(config.listen.port(), 9090);
        assert_eq!(config.timeout_ms, -5);
        assert_eq!(config.workers, 2);
        assert_eq!(config.protocol, ProtocolType::Ping);
        assert!(!config.oneshot);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_trig_mode_codes() {
        let cases = [
            ("0", TriggerMode::Level, TriggerMode::Level),
            ("1", TriggerMode::Level, TriggerMode::Edge),
            ("2", TriggerMode::Edge, TriggerMode::Level),
            ("3", TriggerMode::Edge, TriggerMode::Edge),
            ("7", TriggerMode::Edge, TriggerMode::Edge),
        ];
        for (code, listen, conn) in cases {
            let config = Config::merge(cli(&["--trig-mode", code]), TomlConfig::default()).unwrap();
            assert_eq!((config.listen_trigger, config.conn_trigger), (listen, conn));
        }
    }

    #[test]
    fn test_explicit_trigger_beats_code() {
        let args = cli(&["--trig-mode", "0", "--conn-trigger", "edge"]);
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        assert_eq!(config.listen_trigger, TriggerMode::Level);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
    }

    #[test]
    fn test_invalid_listen() {
        let err = Config::merge(cli(&["-l", "not-an-addr"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListen { .. }));
    }

    #[test]
    fn test_bad_toml_value() {
        let result: Result<TomlConfig, _> = toml::from_str("[server]\nlisten_trigger = \"sideways\"\n");
        assert!(result.is_err());
    }
}
