pub mod daemon;
pub mod jobs;

use clap::{Parser, Subcommand};

/// Resource Downloader - fetch remote resources into a durable local store
#[derive(Parser, Debug)]
#[command(
    name = "rdl",
    version,
    about = "Resource Downloader - fetch remote resources into a durable local store"
)]
pub struct Cli {
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Daemon port
    #[arg(long, default_value_t = 8080, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },

    /// Stop the daemon
    Stop,

    /// Show daemon status
    Status,

    /// Submit a URL for download
    Submit {
        /// http(s) URL whose last path segment names the resource
        url: String,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a single download job
    Get {
        /// Job id
        id: u64,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// List all download jobs
    List {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a download job and its payload
    Delete {
        /// Job id
        id: u64,
    },
}

/// Build the base URL for the daemon API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the daemon is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to daemon at {}:{}. Is it running? (try: rdl start)",
        host, port
    )
}

/// Map a reqwest failure to a user-facing error.
pub(crate) fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Start {
            config,
            port,
            data_dir,
        }) => daemon::cmd_start(&cli.host, config.as_deref(), *port, data_dir.as_deref()).await,
        Some(Commands::Stop) => daemon::cmd_stop(&cli.host, cli.port).await,
        Some(Commands::Status) => daemon::cmd_status(&cli.host, cli.port, cli.verbose).await,
        Some(Commands::Submit { url, json }) => {
            jobs::cmd_submit(&cli.host, cli.port, url, *json).await
        }
        Some(Commands::Get { id, json }) => jobs::cmd_get(&cli.host, cli.port, *id, *json).await,
        Some(Commands::List { json }) => jobs::cmd_list(&cli.host, cli.port, *json).await,
        Some(Commands::Delete { id }) => jobs::cmd_delete(&cli.host, cli.port, *id).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_version_flag() {
        let result = Cli::try_parse_from(["rdl", "--version"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains("0.1.0"));
    }

    #[test]
    fn test_cli_default_host_port() {
        let cli = Cli::try_parse_from(["rdl", "status"]).expect("Should parse with defaults");
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 8080);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["rdl", "list", "--host", "10.0.0.5", "--port", "9000"])
            .expect("Should parse");
        assert_eq!(cli.host, "10.0.0.5");
        assert_eq!(cli.port, 9000);
        assert!(matches!(cli.command, Some(Commands::List { json: false })));
    }

    #[test]
    fn test_cli_submit_parses_url() {
        let cli = Cli::try_parse_from(["rdl", "submit", "http://x/y/file.png", "--json"])
            .expect("Should parse");
        match cli.command {
            Some(Commands::Submit { url, json }) => {
                assert_eq!(url, "http://x/y/file.png");
                assert!(json);
            }
            other => panic!("Expected Submit command, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_get_requires_numeric_id() {
        let cli = Cli::try_parse_from(["rdl", "get", "42"]).expect("Should parse");
        assert!(matches!(cli.command, Some(Commands::Get { id: 42, .. })));
        assert!(Cli::try_parse_from(["rdl", "get", "abc"]).is_err());
        assert!(Cli::try_parse_from(["rdl", "delete"]).is_err());
    }

    #[test]
    fn test_cli_start_all_flags() {
        let cli = Cli::try_parse_from([
            "rdl",
            "start",
            "-c",
            "/etc/rdl.json",
            "-p",
            "9100",
            "--data-dir",
            "/var/lib/rdl",
        ])
        .expect("Should parse");
        match cli.command {
            Some(Commands::Start {
                config,
                port,
                data_dir,
            }) => {
                assert_eq!(config.as_deref(), Some("/etc/rdl.json"));
                assert_eq!(port, Some(9100));
                assert_eq!(data_dir.as_deref(), Some("/var/lib/rdl"));
            }
            other => panic!("Expected Start command, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["rdl", "-v", "status"]).expect("Should parse");
        assert!(cli.verbose);
    }

    #[test]
    fn test_connection_error_message() {
        assert_eq!(
            connection_error_message("127.0.0.1", 8080),
            "Could not connect to daemon at 127.0.0.1:8080. Is it running? (try: rdl start)"
        );
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("localhost", 9000), "http://localhost:9000");
    }
}
