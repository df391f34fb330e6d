use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command, value_parser};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assets::{
    DEFAULT_BIND_ADDRESS, DEFAULT_REORDER_DEPTH, DEFAULT_SERVICE_PORT, SINK_QUEUE_CAPACITY,
    STOP_FLUSH_TIMEOUT,
};
use crate::pipeline::frame_buffer::ReorderConfig;

/// Proxy settings, read from an optional JSON file and overridden by flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_address: String,
    pub port: u16,
    /// Frame sets held back for reordering before the oldest is released
    pub reorder_depth: usize,
    /// Capacity of the display and save queues
    pub sink_capacity: usize,
    /// Bounded wait for pending saves when a session stops
    pub stop_flush_timeout_ms: u64,
    /// Save dispatched frames and poses below this folder
    pub save_folder: Option<PathBuf>,
    /// Write preview images into this folder
    pub display_folder: Option<PathBuf>,
    /// Frames the local pipeline reports as bootstrap before mapping
    pub bootstrap_frames: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_SERVICE_PORT,
            reorder_depth: DEFAULT_REORDER_DEPTH,
            sink_capacity: SINK_QUEUE_CAPACITY,
            stop_flush_timeout_ms: STOP_FLUSH_TIMEOUT.as_millis() as u64,
            save_folder: None,
            display_folder: None,
            bootstrap_frames: 10,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Build the configuration from parsed command line flags
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<PathBuf>("file") {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(port) = matches.get_one::<u16>("port") {
            config.port = *port;
        }
        if let Some(depth) = matches.get_one::<usize>("depth") {
            config.reorder_depth = *depth;
        }
        if let Some(dir) = matches.get_one::<PathBuf>("save") {
            config.save_folder = Some(dir.clone());
        }
        if let Some(dir) = matches.get_one::<PathBuf>("display") {
            config.display_folder = Some(dir.clone());
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind_address, self.port))
    }

    pub fn reorder(&self) -> ReorderConfig {
        ReorderConfig {
            depth: self.reorder_depth,
        }
    }

    pub fn stop_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_flush_timeout_ms)
    }
}

pub fn command() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Port the WebSocket service listens on.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("CONFIG")
                .help("JSON configuration file.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("save")
                .short('s')
                .long("save")
                .value_name("FOLDER")
                .help("Save dispatched images and poses below this folder.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("display")
                .short('d')
                .long("display")
                .value_name("FOLDER")
                .help("Write the latest image of each camera into this folder.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .value_name("N")
                .help("Frame sets buffered for reordering before dispatch.")
                .value_parser(value_parser!(usize)),
        )
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_matches(&command().get_matches_from(["proxy"])).unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.port, 5002);
        assert_eq!(config.reorder().depth, 5);
        assert_eq!(config.sink_capacity, 5);
        assert_eq!(config.socket_addr().unwrap().port(), 5002);
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.json");
        fs::write(&path, r#"{ "port": 6000, "reorder_depth": 3, "sink_capacity": 8 }"#).unwrap();

        let matches = command().get_matches_from([
            "proxy",
            "-f",
            path.to_str().unwrap(),
            "--depth",
            "7",
            "-s",
            "/tmp/out",
        ]);
        let config = ProxyConfig::from_matches(&matches).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.reorder_depth, 7);
        assert_eq!(config.sink_capacity, 8);
        assert_eq!(config.save_folder, Some(PathBuf::from("/tmp/out")));
        assert_eq!(config.display_folder, None);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.json");
        fs::write(&path, "port = 1").unwrap();
        assert!(ProxyConfig::load(&path).is_err());
        assert!(ProxyConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_bad_port_flag_is_rejected() {
        assert!(command().try_get_matches_from(["proxy", "-p", "70000"]).is_err());
    }
}
