use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "manman")]
#[command(author = "Manman Team")]
#[command(version = "0.1.0")]
#[command(about = "Game-server fleet control plane", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus <MANMAN_ENV>.toml)
    #[arg(short, long, default_value = "config", env = "MANMAN_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the control plane: migrations, broker, reply loop and HTTP API
    Serve {
        /// Override api.port
        #[arg(short, long)]
        port: Option<u16>,
        /// Skip applying database migrations on startup
        #[arg(long)]
        skip_migrations: bool,
    },
    /// Apply database migrations and exit
    Migrate,
    /// List unallocated host ports on a server
    AvailablePorts {
        /// Server id
        #[arg(long)]
        server_id: i64,
        /// First port of the range (inclusive)
        #[arg(long, default_value = "25565")]
        start: u32,
        /// Last port of the range (inclusive)
        #[arg(long, default_value = "25665")]
        end: u32,
        /// TCP or UDP
        #[arg(long, default_value = "TCP")]
        protocol: String,
    },
}

impl Cli {
    /// `serve` when no subcommand is given
    pub fn command_or_default(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve {
            port: None,
            skip_migrations: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::try_parse_from(["manman"]).unwrap();
        assert_eq!(
            cli.command_or_default(),
            Commands::Serve {
                port: None,
                skip_migrations: false
            }
        );
        assert_eq!(cli.config, "config");
    }

    #[test]
    fn test_available_ports_args() {
        let cli = Cli::try_parse_from([
            "manman",
            "available-ports",
            "--server-id",
            "3",
            "--start",
            "7000",
            "--end",
            "7010",
            "--protocol",
            "udp",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::AvailablePorts {
                server_id,
                start,
                end,
                protocol,
            }) => {
                assert_eq!((server_id, start, end), (3, 7000, 7010));
                assert_eq!(protocol, "udp");
            }
            _ => panic!("expected available-ports"),
        }
    }
}
