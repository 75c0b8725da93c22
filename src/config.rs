//! Configuration management
//!
//! Command-line arguments, an optional TOML file under the configuration
//! directory, and the merge of the two. CLI values win over the file, the
//! file wins over the built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Name of the optional configuration file inside the config directory.
const CONFIG_FILE: &str = "rdpmux.toml";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "rdpmux")]
#[command(version, about = "Multiplexes VM displays onto the RDP wire", long_about = None)]
pub struct Args {
    /// Base port for listener allocation
    #[arg(short, long, default_value_t = 3901)]
    pub port: u16,

    /// Disable authentication for peer connections
    #[arg(short = 'n', long = "no-auth", default_value_t = false)]
    pub no_auth: bool,

    /// Directory for certificates and auxiliary files
    #[arg(short, long = "config-path", default_value = "/etc/rdpmux")]
    pub config_path: String,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Merged runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base port for listener allocation
    pub base_port: u16,
    /// Whether new listeners require authentication
    pub authenticate: bool,
    /// Directory holding certificates and the optional config file
    pub config_dir: PathBuf,
    /// Path of the guest-facing router socket
    pub socket_path: PathBuf,
    /// Capture tick rate handed to new listeners
    pub capture_fps: u32,
    /// Which message bus carries the management surface
    pub management_bus: BusKind,
}

/// The bus the management surface registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// The system bus (production default)
    System,
    /// The session bus (development)
    Session,
}

/// The subset of [`Config`] that may come from the TOML file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    capture_fps: Option<u32>,
    management_bus: Option<BusKind>,
}

impl Config {
    /// Default socket path: a world-reachable location under the temp
    /// directory.
    pub fn default_socket_path() -> PathBuf {
        std::env::temp_dir().join("rdpmux").join("rdpmux.sock")
    }

    /// Build the runtime configuration from the CLI arguments, folding in
    /// the optional config file found under the configuration directory.
    pub fn load(args: &Args) -> Result<Self> {
        let config_dir = PathBuf::from(&args.config_path);

        let file = Self::read_file(&config_dir.join(CONFIG_FILE))?;

        let config = Self {
            base_port: args.port,
            authenticate: !args.no_auth,
            config_dir,
            socket_path: file.socket_path.unwrap_or_else(Self::default_socket_path),
            capture_fps: file.capture_fps.unwrap_or(30),
            management_bus: file.management_bus.unwrap_or(BusKind::System),
        };

        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<FileConfig> {
        if !path.exists() {
            return Ok(FileConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("failed to parse config file")
    }

    /// Validate ranges the CLI type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            anyhow::bail!("base port must be nonzero");
        }
        if self.capture_fps == 0 || self.capture_fps > 120 {
            anyhow::bail!("capture_fps must be within 1..=120");
        }
        Ok(())
    }

    /// Path to the TLS certificate inside the config directory.
    pub fn cert_path(&self) -> PathBuf {
        self.config_dir.join("server.crt")
    }

    /// Path to the TLS private key inside the config directory.
    pub fn key_path(&self) -> PathBuf {
        self.config_dir.join("server.key")
    }
}
