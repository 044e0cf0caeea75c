//! Command-line argument parsing.

use btlink::config::{ControllerConfig, TransportMode};
use clap::Parser;
use std::path::PathBuf;

/// Controller for a single-peer serial link.
#[derive(Parser, Debug, Clone)]
#[command(name = "btlink")]
#[command(about = "Connect to a paired device and forward stdin over the link")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.config/btlink/config.toml, /etc/btlink/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Peer to connect to (Bluetooth address, or host:port in TCP simulation).
    #[arg(long)]
    pub peer: Option<String>,

    /// Dial out without requiring an authenticated link.
    #[arg(long)]
    pub insecure: bool,

    /// Transport mode (rfcomm, tcp_simulation).
    #[arg(long)]
    pub mode: Option<TransportMode>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Command-line flags win over file and environment.
    pub fn apply(&self, config: &mut ControllerConfig) {
        if let Some(peer) = &self.peer {
            config.peer = Some(peer.clone());
        }
        if self.insecure {
            config.secure = false;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["btlink"]);
        assert!(cli.config.is_none());
        assert!(cli.peer.is_none());
        assert!(!cli.insecure);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "btlink",
            "--peer",
            "00:11:22:33:44:55",
            "--insecure",
            "--mode",
            "tcp_simulation",
        ]);
        let mut config = ControllerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.peer.as_deref(), Some("00:11:22:33:44:55"));
        assert!(!config.secure);
        assert_eq!(config.mode, TransportMode::TcpSimulation);
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(Cli::try_parse_from(["btlink", "--mode", "serial"]).is_err());
    }
}
