//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// LLMesh Node - share a local language model with your other devices
///
/// Joins the signaling relay, opens direct data channels to peers, and
/// serves or sends chat requests over them.
#[derive(Parser, Debug)]
#[command(name = "llmesh-node")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the mesh and run until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "LLMESH_CONFIG")]
        config: Option<String>,

        /// Announce local models to the mesh
        #[arg(long, conflicts_with = "no_host")]
        host: bool,

        /// Join as a client only
        #[arg(long)]
        no_host: bool,
    },

    /// Send one chat prompt to a peer and print the reply
    Chat {
        /// Peer to ask
        #[arg(long)]
        peer: String,

        /// Model the peer should run
        #[arg(short, long)]
        model: String,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,

        /// Prompt text
        prompt: String,

        /// Path to configuration file
        #[arg(short, long, env = "LLMESH_CONFIG")]
        config: Option<String>,
    },

    /// Probe this device and show the selected connection timeout profile
    Probe {
        /// Probe duration in milliseconds
        #[arg(long, default_value = "200")]
        budget_ms: u64,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

impl Commands {
    /// `Some(true)` for --host, `Some(false)` for --no-host
    pub fn hosting_override(&self) -> Option<bool> {
        match self {
            Commands::Run { host: true, .. } => Some(true),
            Commands::Run { no_host: true, .. } => Some(false),
            _ => None,
        }
    }
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["llmesh-node", "run"]);
        assert_eq!(cli.command.hosting_override(), None);
        match cli.command {
            Commands::Run { config, .. } => assert!(config.is_none()),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_host_flags() {
        let host = Cli::parse_from(["llmesh-node", "run", "--host"]);
        assert_eq!(host.command.hosting_override(), Some(true));

        let client = Cli::parse_from(["llmesh-node", "run", "--no-host"]);
        assert_eq!(client.command.hosting_override(), Some(false));

        assert!(Cli::try_parse_from(["llmesh-node", "run", "--host", "--no-host"]).is_err());
    }

    #[test]
    fn test_chat_command() {
        let cli = Cli::parse_from([
            "llmesh-node",
            "chat",
            "--peer",
            "node-abc",
            "--model",
            "phi3",
            "why is the sky blue",
        ]);
        match cli.command {
            Commands::Chat {
                peer,
                model,
                prompt,
                system,
                ..
            } => {
                assert_eq!(peer, "node-abc");
                assert_eq!(model, "phi3");
                assert_eq!(prompt, "why is the sky blue");
                assert!(system.is_none());
            }
            _ => panic!("Expected Chat command"),
        }
    }

    #[test]
    fn test_chat_requires_peer() {
        assert!(Cli::try_parse_from(["llmesh-node", "chat", "--model", "phi3", "hi"]).is_err());
    }

    #[test]
    fn test_probe_defaults() {
        let cli = Cli::parse_from(["llmesh-node", "probe"]);
        match cli.command {
            Commands::Probe { budget_ms, json } => {
                assert_eq!(budget_ms, 200);
                assert!(!json);
            }
            _ => panic!("Expected Probe command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["llmesh-node", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["llmesh-node", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
