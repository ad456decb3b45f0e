//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - helper / backend: the managed server processes
//! - supervise: launch and watch both
//! - mounts, disk-types: app-role client commands
//! - shutdown: ask a managed process to exit

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// DiskJockey - helper, backend and supervisor for the mount IPC fabric
#[derive(Parser, Debug)]
#[command(name = "diskjockey")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Flags the supervisor hands to every managed process
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Configuration directory for this process
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Unix socket to accept shutdown requests on
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Supervisor socket to announce readiness to
    #[arg(long, requires = "process_name")]
    pub announce_socket: Option<PathBuf>,

    /// Name to announce under
    #[arg(long)]
    pub process_name: Option<String>,
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the helper process
    Helper {
        #[command(flatten)]
        serve: ServeArgs,
    },

    /// Run the backend process
    Backend {
        #[command(flatten)]
        serve: ServeArgs,

        /// Port of the running helper to report mount status to
        #[arg(long)]
        helper_port: Option<u16>,
    },

    /// Launch the helper and backend and keep them running until Ctrl-C
    Supervise,

    /// Manage mounts on a running backend
    Mounts {
        /// Backend port
        #[arg(short, long)]
        port: u16,

        #[command(subcommand)]
        command: MountCommands,
    },

    /// List the disk types a backend supports
    DiskTypes {
        /// Backend port
        #[arg(short, long)]
        port: u16,
    },

    /// Ask a managed process to shut down
    Shutdown {
        /// Control socket of the process
        #[arg(long)]
        control_socket: PathBuf,
    },
}

/// Mount management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum MountCommands {
    /// List all mounts
    List,

    /// Create a mount
    Create {
        /// Mount name
        name: String,

        /// Disk type (see `disk-types`)
        #[arg(short = 't', long)]
        disk_type: String,

        /// Settings as key=value, repeatable
        #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
        options: Vec<(String, String)>,
    },

    /// Delete a mount
    Delete {
        /// Mount id
        id: u32,
    },

    /// Mount a mount
    Mount {
        /// Mount id
        id: u32,
    },

    /// Unmount a mount
    Unmount {
        /// Mount id
        id: u32,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["diskjockey"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["diskjockey", "supervise", "-v", "-c", "/tmp/dj.yml"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/dj.yml")));
        assert!(matches!(cli.command, Commands::Supervise));
    }

    #[test]
    fn test_helper_flags() {
        let cli = Cli::try_parse_from([
            "diskjockey",
            "helper",
            "--config-dir",
            "/tmp/cfg",
            "--control-socket",
            "/tmp/helper.sock",
        ])
        .unwrap();
        match cli.command {
            Commands::Helper { serve } => {
                assert_eq!(serve.config_dir, Some(PathBuf::from("/tmp/cfg")));
                assert_eq!(serve.control_socket, Some(PathBuf::from("/tmp/helper.sock")));
                assert!(serve.announce_socket.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_backend_helper_port() {
        let cli = Cli::try_parse_from(["diskjockey", "backend", "--helper-port", "4100"]).unwrap();
        match cli.command {
            Commands::Backend { helper_port, .. } => assert_eq!(helper_port, Some(4100)),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_announce_requires_name() {
        let result = Cli::try_parse_from(["diskjockey", "helper", "--announce-socket", "/tmp/a.sock"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mounts_create() {
        let cli = Cli::try_parse_from([
            "diskjockey",
            "mounts",
            "--port",
            "5000",
            "create",
            "docs",
            "-t",
            "local_directory",
            "-o",
            "path=/home/me/docs",
        ])
        .unwrap();
        match cli.command {
            Commands::Mounts {
                port,
                command: MountCommands::Create {
                    name,
                    disk_type,
                    options,
                },
            } => {
                assert_eq!(port, 5000);
                assert_eq!(name, "docs");
                assert_eq!(disk_type, "local_directory");
                assert_eq!(options, vec![("path".to_string(), "/home/me/docs".to_string())]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("a=b=c"), Ok(("a".into(), "b=c".into())));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
