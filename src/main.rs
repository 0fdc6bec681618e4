//! Task hub server
//!
//! Serves the REST/WebSocket API by default, or the MCP tools over stdio.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use taskhub_server::api::{AppState, start_server};
use taskhub_server::auth::AuthService;
use taskhub_server::cache::Cache;
use taskhub_server::cli::{Cli, Command, McpArgs, ServeArgs};
use taskhub_server::config::{Config, ConfigLoader};
use taskhub_server::db::Database;
use taskhub_server::logging::{LogTarget, init_logging};
use taskhub_server::mcp::{HttpOptions, run_mcp};
use taskhub_server::notifications::NotificationService;
use taskhub_server::services::Services;
use tracing::{debug, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the MCP protocol, so logs must go elsewhere.
    let mut target = LogTarget::parse(&cli.log);
    if matches!(cli.command, Some(Command::Mcp(_))) && target == LogTarget::Stdout {
        target = LogTarget::Stderr;
    }
    init_logging(&target, cli.verbose)?;

    let mut loader = ConfigLoader::load(cli.config.as_deref().map(Path::new))?;
    for (tier, path) in loader.sources() {
        debug!(tier = %tier, path = %path.display(), "Config source");
    }
    if let Some(db_path) = &cli.database {
        loader.config_mut().database.path = db_path.into();
    }
    let config = loader.into_config();
    config.validate()?;

    match cli.command {
        Some(Command::Migrate) => run_migrate(&config),
        Some(Command::Mcp(args)) => run_mcp_command(config, args).await,
        Some(Command::Serve(args)) => run_serve(config, args).await,
        None => run_serve(config, ServeArgs::default()).await,
    }
}

fn open_database(config: &Config) -> Result<Database> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.database.path, &config.database.pool)?;
    info!("Database: {:?}", config.database.path);
    Ok(db)
}

fn build_services(config: &Config) -> Result<(Services, Arc<AuthService>)> {
    let db = open_database(config)?;
    let cache = Arc::new(Cache::from_config(&config.cache));
    let notifications = Arc::new(NotificationService::new(&config.notifications));
    let auth = Arc::new(AuthService::new(&config.auth, db.clone())?);
    let services = Services::new(db, cache, notifications, config);
    Ok((services, auth))
}

/// Periodically drop expired rows from the inheritance cache table.
fn spawn_cache_purge(db: Database) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let db = db.clone();
            match tokio::task::spawn_blocking(move || db.purge_resolutions()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(purged)) => debug!(purged, "Purged expired context resolutions"),
                Ok(Err(e)) => warn!(error = %e, "Failed to purge context resolutions"),
                Err(e) => warn!(error = %e, "Purge task panicked"),
            }
        }
    });
}

fn run_migrate(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    match db.schema_version()? {
        Some(version) => println!("Schema version: {}", version),
        None => println!("Schema version: none"),
    }
    Ok(())
}

async fn run_serve(config: Config, args: ServeArgs) -> Result<()> {
    info!("Starting taskhub-server v{}", env!("CARGO_PKG_VERSION"));
    let (services, auth) = build_services(&config)?;
    info!(
        provider = %auth.provider_kind(),
        cache = services.cache.backend_name(),
        "Services initialized"
    );
    spawn_cache_purge(services.db.clone());

    let host = args.host.unwrap_or(config.server.host.clone());
    let port = args.port.unwrap_or(config.server.port);
    let state = AppState::new(services, auth);
    let handle = start_server(state, &host, port, &config.server.cors_origins).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;
    Ok(())
}

async fn run_mcp_command(config: Config, args: McpArgs) -> Result<()> {
    info!("Starting taskhub-server MCP v{}", env!("CARGO_PKG_VERSION"));
    let (services, auth) = build_services(&config)?;
    spawn_cache_purge(services.db.clone());

    let http = args.http.then(|| HttpOptions {
        host: args.serve.host.clone().unwrap_or(config.server.host.clone()),
        port: args.serve.port.unwrap_or(config.server.port),
        cors_origins: config.server.cors_origins.clone(),
    });
    run_mcp(services, auth, &args.token, http).await
}
