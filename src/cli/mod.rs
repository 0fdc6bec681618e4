//! Command line definitions.
//!
//! `serve` (the default) runs the HTTP API, `mcp` runs the stdio MCP server
//! and `migrate` applies database migrations.

use clap::{Args, Parser, Subcommand};

/// Multi-tenant task hub: REST API, WebSocket notifications and MCP tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API (default if no subcommand given)
    Serve(ServeArgs),

    /// Run the MCP server on stdio
    Mcp(McpArgs),

    /// Apply pending database migrations and print the schema version
    Migrate,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Bind address (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct McpArgs {
    /// Access token of the user the tools act as
    #[arg(long, env = "TASKHUB_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Also serve the HTTP API from this process
    #[arg(long)]
    pub http: bool,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["taskhub-server"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "2");
        assert!(!cli.verbose);
    }

    #[test]
    fn parses_serve_overrides() {
        let cli = Cli::try_parse_from(["taskhub-server", "-d", "/tmp/x.db", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.database.as_deref(), Some("/tmp/x.db"));
        match cli.command {
            Some(Command::Serve(args)) => {
                assert_eq!(args.port, Some(9000));
                assert!(args.host.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parses_mcp_with_http() {
        let cli = Cli::try_parse_from(["taskhub-server", "mcp", "--token", "abc", "--http", "--port", "8100"]).unwrap();
        match cli.command {
            Some(Command::Mcp(args)) => {
                assert_eq!(args.token, "abc");
                assert!(args.http);
                assert_eq!(args.serve.port, Some(8100));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["taskhub-server", "migrate", "--verbose", "--log", "off"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Migrate)));
        assert!(cli.verbose);
        assert_eq!(cli.log, "off");
    }
}
