//! Command line, config file and legacy port file, resolved into one `ServerConfig`.
//!
//! Port precedence: `--port`, then `port` in the config file, then the
//! port file, then `DEFAULT_PORT`.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 1256;
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_PORT_FILE: &str = "port.info";
pub const DEFAULT_DATA_DIR: &str = ".";

#[derive(Parser, Debug, Clone)]
#[command(name = "sealdrop")]
#[command(about = "Encrypted file-transfer server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "SEALDROP_HOST")]
    pub host: Ipv4Addr,

    /// Port to listen on (overrides config and port file)
    #[arg(short, long, env = "SEALDROP_PORT")]
    pub port: Option<u16>,

    /// File holding the port number
    #[arg(long, default_value = DEFAULT_PORT_FILE)]
    pub port_file: PathBuf,

    /// Where the database and client files live
    #[arg(short, long, env = "SEALDROP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum number of connections served at once
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Contents of the optional TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub max_workers: Option<usize>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl ServerConfig {
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_file(&expand_tilde(path))?,
            None => FileConfig::default(),
        };

        let port = match cli.port.or(file.port) {
            Some(port) => port,
            None => read_port_file(&expand_tilde(&cli.port_file)),
        };
        let data_dir = cli
            .data_dir
            .clone()
            .or(file.data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let max_workers = cli
            .max_workers
            .or(file.max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS);
        if max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }

        Ok(Self {
            host: cli.host,
            port,
            data_dir: expand_tilde(&data_dir),
            max_workers,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

/// Port from the legacy port file, or the default if it is missing or bad.
pub fn read_port_file(path: &Path) -> u16 {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                "Cannot read port file {} ({}), using default port {}",
                path.display(),
                e,
                DEFAULT_PORT
            );
            return DEFAULT_PORT;
        }
    };
    match contents.trim().parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            tracing::warn!(
                "Invalid port {:?} in {}, using default port {}",
                contents.trim(),
                path.display(),
                DEFAULT_PORT
            );
            DEFAULT_PORT
        }
    }
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}
