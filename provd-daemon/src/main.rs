mod bus;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use provd_core::app::ApplicationParams;
use provd_core::config::ConfigCollection;
use provd_core::device::DeviceCollection;
use provd_core::http::{self, HttpServerState};
use provd_core::ident::{RequestProcessingService, TftpRequestProcessingService};
use provd_core::pgasso::ReverseAlphabeticConflictSolver;
use provd_core::plugin::{PluginManager, StandardPluginDriver};
use provd_core::tftp::TftpServer;
use provd_core::{DocumentCollection, IdGenerator, ProvisioningApplication, ServiceConfigStore};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Telephony endpoint provisioning server.
#[derive(Debug, Parser)]
#[command(name = "provd", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Directory holding the configuration file.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Override the TFTP listening port.
    #[arg(long)]
    tftp_port: Option<u16>,

    /// Override the HTTP (REST-facing) listening port.
    #[arg(long)]
    rest_port: Option<u16>,

    /// Log to stderr instead of the default sink.
    #[arg(short = 's')]
    stderr_logging: bool,

    /// Increase logging verbosity.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(cli: &Cli) {
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.stderr_logging {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    if let Err(e) = run(cli).await {
        error!("Fatal startup error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config_file.as_deref(), cli.config_dir.as_deref())?;
    if let Some(tftp_port) = cli.tftp_port {
        config.general.tftp_port = tftp_port;
    }
    if let Some(rest_port) = cli.rest_port {
        config.general.http_port = rest_port;
    }
    config.ensure_directories()?;
    info!(
        "Starting provd with storage under {}",
        config.general.base_storage_dir.display()
    );

    // persistence
    let dev_collection = DeviceCollection::new(
        DocumentCollection::open(config.devices_file(), IdGenerator::default())
            .await
            .context("could not open device store")?,
    );
    let cfg_collection = ConfigCollection::new(
        DocumentCollection::open(config.configs_file(), IdGenerator::default())
            .await
            .context("could not open config store")?,
    );
    let service_config = Arc::new(
        ServiceConfigStore::open(config.app_state_file())
            .await
            .context("could not open service configuration")?,
    );

    // plugin manager
    let mut pg_mgr = PluginManager::new(config.plugins_dir(), config.general.cache_dir.clone())
        .context("could not create plugin manager")?
        .with_compat_checks(
            config.general.check_compat_min,
            config.general.check_compat_max,
        );
    pg_mgr.register_driver(Box::new(StandardPluginDriver));
    let pg_mgr = Arc::new(pg_mgr);
    pg_mgr.set_server(service_config.plugin_server());
    if let Err(e) = pg_mgr.set_proxies(&service_config.proxies()) {
        warn!("Invalid proxy configuration: {}", e);
    }

    // application
    let app = Arc::new(ProvisioningApplication::new(ApplicationParams {
        cfg_collection,
        dev_collection,
        pg_mgr: pg_mgr.clone(),
        service_config: service_config.clone(),
        base_raw_config: config.base_raw_config()?,
        general_config: serde_json::json!({
            "base_storage_dir": config.general.base_storage_dir,
            "cache_dir": config.general.cache_dir,
        }),
        plugin_specific_configs: config.plugin_specific_configs()?,
        use_provisioning_key: config.use_provisioning_key(),
    })?);
    app.ensure_indexes().await?;
    app.load_all_plugins().await;

    // request processing pipeline
    let process_service = Arc::new(RequestProcessingService::standard(
        app.clone(),
        Arc::new(ReverseAlphabeticConflictSolver),
    ));

    // servers
    let tftp_addr: SocketAddr = ([0, 0, 0, 0], config.general.tftp_port).into();
    let tftp_service = Arc::new(TftpRequestProcessingService::new(
        app.clone(),
        process_service.clone(),
    ));
    let tftp_server = TftpServer::bind(tftp_addr, tftp_service)
        .await
        .context("could not bind TFTP server")?;
    let tftp_task = tokio::spawn(async move {
        if let Err(e) = tftp_server.run().await {
            error!("TFTP server stopped: {}", e);
        }
    });

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.general.http_port).into();
    let http_state = Arc::new(HttpServerState {
        app: app.clone(),
        process_service: process_service.clone(),
        trusted_proxies: config.general.num_http_proxies,
    });
    let http_task = tokio::spawn(async move {
        if let Err(e) = http::serve(http_addr, http_state).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    // bus consumer; the sender side belongs to the external bus client
    let (_bus_tx, bus_rx) = mpsc::channel::<bus::BusEvent>(16);
    let bus_task = tokio::spawn(bus::run_consumer(app.clone(), bus_rx));

    info!("provd started");
    tokio::signal::ctrl_c()
        .await
        .context("could not wait for shutdown signal")?;
    info!("Shutdown signal received");

    tftp_task.abort();
    http_task.abort();
    bus_task.abort();
    app.close().await?;
    Ok(())
}
