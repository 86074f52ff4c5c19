use std::path::PathBuf;

use clap::{Parser, Subcommand};

use apctl_core::config;

/// Wireless network control-plane supervisor for a multi-node access-point appliance.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path for the configuration tree daemon.
    #[arg(short, long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_socket: PathBuf,

    /// Path to the radio daemon binary.
    #[arg(long, env = "APCTLD_RADIO_BINARY", default_value = "/usr/sbin/hostapd")]
    pub daemon_binary: PathBuf,

    /// Directory the radio daemon's per-device config files are rendered into.
    #[arg(long, env = "APCTLD_CONFIG_DIR", default_value = "/var/run/apctld")]
    pub config_dir: PathBuf,

    /// This node's identifier in the multi-node appliance.
    #[arg(long, env = "APCTLD_SELF_NODE", default_value = "node0")]
    pub self_node: String,

    /// This node's numeric index, used to derive its router addresses.
    #[arg(long, env = "APCTLD_NODE_INDEX", default_value_t = 0)]
    pub node_index: u8,

    /// Radio daemon verbosity level, forwarded as `-d <n>`.
    #[arg(long, env = "APCTLD_VERBOSITY", default_value_t = 0)]
    pub verbosity: u8,

    /// Log file path, or `-` for stdout.
    #[arg(long, env = "APCTLD_LOG_FILE", default_value = apctl_core::logging::DEFAULT_LOG_PATH)]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<SubCommand>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum SubCommand {
    /// Enumerate wireless NICs and report per-NIC validity.
    Wifi {
        /// Only print a validity summary, no per-NIC detail.
        #[arg(short, long, conflicts_with = "verbose")]
        quiet: bool,
        /// Print full wireless capability detail for each NIC.
        #[arg(short, long)]
        verbose: bool,
        /// Restrict the report to a single interface.
        interface: Option<String>,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let args = Cli::try_parse_from(["apctld"]).unwrap();
        assert_eq!(args.self_node, "node0");
        assert!(args.command.is_none());
    }

    #[test]
    fn parses_wifi_subcommand_with_interface() {
        let args = Cli::try_parse_from(["apctld", "wifi", "-v", "wlan0"]).unwrap();
        match args.command {
            Some(SubCommand::Wifi { verbose, interface, .. }) => {
                assert!(verbose);
                assert_eq!(interface.as_deref(), Some("wlan0"));
            }
            _ => panic!("expected wifi subcommand"),
        }
    }

    #[test]
    fn quiet_and_verbose_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["apctld", "wifi", "-q", "-v"]).is_err());
    }
}
