use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_phat.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Image cache and MQTT presence bridge for phat e-ink displays", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(short, long, env = "HTTP_LISTEN", help = "Address the HTTP server listens on.")]
    pub listen: Option<String>,

    #[clap(short, long, env = "MQTT_BROKER", help = "MQTT broker URL (tcp://host:port).")]
    pub broker: Option<String>,

    #[clap(short = 'x', long = "ext-host", env = "EXTERNAL_ADDR", help = "Base URL displays use to reach this server.")]
    pub ext_host: Option<String>,

    #[clap(long, env = "MQTT_CLIENT_ID", help = "Client id presented to the broker.")]
    pub client_id: Option<String>,

    #[clap(long, env = "PHAT_ANNOUNCE_INTERVAL", help = "Seconds between periodic image announcements.")]
    pub announce_interval_seconds: Option<u64>,

    #[clap(long, env = "PHAT_CONNECT_TIMEOUT", help = "Seconds to wait for the broker at startup.")]
    pub connect_timeout_seconds: Option<u64>,

    #[clap(long, env = "PHAT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PHAT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PHAT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(short, long, help = "Verbose logging (same as --log-level debug).")]
    #[serde(default)]
    pub verbose: bool,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub broker: String,
    pub ext_host: String,
    pub client_id: String,
    pub announce_interval: Duration,
    pub connect_timeout: Duration,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            listen: other.listen.or(self.listen),
            broker: other.broker.or(self.broker),
            ext_host: other.ext_host.or(self.ext_host),
            client_id: other.client_id.or(self.client_id),
            announce_interval_seconds: other.announce_interval_seconds.or(self.announce_interval_seconds),
            connect_timeout_seconds: other.connect_timeout_seconds.or(self.connect_timeout_seconds),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            verbose: other.verbose || self.verbose,
        }
    }

    fn defaults() -> Config {
        Config {
            listen: Some("[::]:39391".to_string()),
            broker: Some("tcp://127.0.0.1:1883".to_string()),
            ext_host: Some("http://127.0.0.1:39391".to_string()),
            client_id: Some("phatmqttserver".to_string()),
            announce_interval_seconds: Some(600),
            connect_timeout_seconds: Some(10),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// Validates and freezes the merged values.
    pub fn resolve(self) -> Result<Settings> {
        let listen = self.listen.context("listen address is not set")?;
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address '{listen}'"))?;

        let announce_interval_seconds = self.announce_interval_seconds.unwrap_or(600);
        if announce_interval_seconds == 0 {
            bail!("announce interval must be at least one second");
        }

        let log_level = if self.verbose {
            "debug".to_string()
        } else {
            self.log_level.unwrap_or_else(|| "info".to_string())
        };

        Ok(Settings {
            listen,
            broker: self.broker.context("MQTT broker is not set")?,
            ext_host: self
                .ext_host
                .context("external address is not set")?
                .trim_end_matches('/')
                .to_string(),
            client_id: self.client_id.context("MQTT client id is not set")?,
            announce_interval: Duration::from_secs(announce_interval_seconds),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds.unwrap_or(10)),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level,
        })
    }
}

/// Reads a JSON config file. A missing file is not an error.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        eprintln!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Default config file: `./server_phat.conf`, else `<config dir>/phat/server_phat.conf`.
fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("phat").join(DEFAULT_CONFIG_FILE))
        .unwrap_or(local)
}

/// Defaults, then the config file, then environment variables and CLI flags.
///
/// Logging is not up yet when this runs, so problems go to stderr.
pub fn load_config_from(cli_args: Config) -> Result<Settings> {
    let config_file_path = cli_args.config_path.clone().unwrap_or_else(default_config_path);

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli_args).resolve()
}

pub fn load_config() -> Result<Settings> {
    load_config_from(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_file() -> Config {
        Config {
            config_path: Some(PathBuf::from("/nonexistent/phat/server_phat.conf")),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_the_deployed_service() {
        let settings = load_config_from(no_file()).unwrap();
        assert_eq!(settings.listen, "[::]:39391".parse().unwrap());
        assert_eq!(settings.broker, "tcp://127.0.0.1:1883");
        assert_eq!(settings.ext_host, "http://127.0.0.1:39391");
        assert_eq!(settings.client_id, "phatmqttserver");
        assert_eq!(settings.announce_interval, Duration::from_secs(600));
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn file_values_sit_between_defaults_and_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"broker": "tcp://broker.lan:1883", "extHost": "http://frame.lan:39391/", "announceIntervalSeconds": 60}}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            broker: Some("mqtt://override:2883".to_string()),
            verbose: true,
            ..Default::default()
        };
        let settings = load_config_from(cli).unwrap();

        assert_eq!(settings.broker, "mqtt://override:2883");
        assert_eq!(settings.ext_host, "http://frame.lan:39391");
        assert_eq!(settings.announce_interval, Duration::from_secs(60));
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(load_config_from(cli).unwrap().broker, "tcp://127.0.0.1:1883");
    }

    #[test]
    fn bad_values_are_rejected() {
        let cli = Config {
            listen: Some("not-an-address".to_string()),
            ..no_file()
        };
        assert!(load_config_from(cli).is_err());

        let cli = Config {
            announce_interval_seconds: Some(0),
            ..no_file()
        };
        assert!(load_config_from(cli).is_err());
    }

    #[test]
    fn short_flags_match_the_long_ones() {
        let cli = Config::try_parse_from([
            "server_phat",
            "-l",
            "127.0.0.1:8080",
            "-b",
            "tcp://broker.lan:1883",
            "-x",
            "http://frame.lan:8080",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(cli.broker.as_deref(), Some("tcp://broker.lan:1883"));
        assert_eq!(cli.ext_host.as_deref(), Some("http://frame.lan:8080"));
        assert!(cli.verbose);
    }
}
