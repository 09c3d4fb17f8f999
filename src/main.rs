//! WolfRelay - MariaDB Protocol Proxy and Binlog Relay
//!
//! Entry point: loads configuration, sizes the worker pool, starts the
//! monitor, the client listener and the binlog router, then waits for a
//! shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfrelay::binlog::master::MasterConnection;
use wolfrelay::binlog::{Router, RouterSettings};
use wolfrelay::config::WolfRelayConfig;
use wolfrelay::dcb::DcbLimits;
use wolfrelay::error::Result;
use wolfrelay::monitor::mariadb::MariadbMonitor;
use wolfrelay::monitor::{Monitor, ServerClaims};
use wolfrelay::server::ServerSet;
use wolfrelay::worker::WorkerPool;
use wolfrelay::{binlog, proxy, tuning};

/// WolfRelay - MariaDB Protocol Proxy and Binlog Relay
#[derive(Parser)]
#[command(name = "wolfrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfrelay.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfrelay.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "relay-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the relay node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfRelay...");

    if nix::unistd::geteuid().is_root() {
        tracing::error!("WolfRelay refuses to run as root; use a service account");
        std::process::exit(1);
    }

    let config = match WolfRelayConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    // Size the worker pool from the hardware unless overridden.
    let tuned = if config.performance.auto_tune {
        tuning::auto_tune()
    } else {
        tuning::TunedConfig::default()
    };
    let routing_workers = if config.performance.routing_workers > 0 {
        config.performance.routing_workers
    } else {
        tuned.routing_workers
    };
    tracing::info!("{}", tuning::tuning_summary(&tuned));

    let pool = Arc::new(WorkerPool::start(routing_workers));
    let servers = Arc::new(ServerSet::from_config(&config.servers));

    // Per-server TLS contexts for backends that require it.
    for server_config in &config.servers {
        if server_config.ssl_enabled {
            let Some(ca) = &server_config.ssl_ca else {
                tracing::error!(server = server_config.name, "ssl_enabled requires ssl_ca");
                std::process::exit(1);
            };
            let tls = proxy::listener::load_client_tls(ca)?;
            if let Some(server) = servers.get(&server_config.name) {
                server.set_tls_config(Some(tls));
            }
        }
    }

    let claims = ServerClaims::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Cluster monitor
    let monitor = if config.monitor.enabled && !config.monitor.servers.is_empty() {
        let owned: Vec<_> = config
            .monitor
            .servers
            .iter()
            .filter_map(|name| servers.get(name))
            .collect();
        let monitor = Monitor::start(
            &config.monitor,
            owned,
            Box::new(MariadbMonitor::new()),
            claims.clone(),
            config.journal_path(),
        )?;
        tracing::info!(monitor = monitor.name(), "cluster monitor running");
        Some(monitor)
    } else {
        None
    };

    // Client listener
    if config.listener.enabled {
        let listener_config = config.listener.clone();
        let listener_servers = servers.clone();
        let listener_pool = pool.clone();
        let listener_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy::run_listener(
                listener_config,
                listener_servers,
                listener_pool,
                listener_shutdown,
            )
            .await
            {
                tracing::error!("MySQL listener failed: {}", e);
            }
        });
    }

    // Binlog router
    if config.binlog.enabled {
        let settings = RouterSettings::from_config(&config.binlog, config.binlog_dir())?;
        let router = Router::new(settings)?;
        tracing::info!(
            file = router.binlog_name(),
            position = router.positions().binlog_position,
            "binlog router ready"
        );

        let master = MasterConnection::new(router.clone());
        tokio::spawn(master.run(shutdown_rx.clone()));

        let limits = DcbLimits {
            high_water: config.listener.high_water,
            low_water: config.listener.low_water,
            max_read_amount: config.listener.max_read_amount,
        };
        let slave_router = router.clone();
        let slave_pool = pool.clone();
        let slave_addr = config.binlog.listen_address.clone();
        let slave_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = binlog::slave::run_listener(
                slave_router,
                slave_pool,
                slave_addr,
                limits,
                slave_shutdown,
            )
            .await
            {
                tracing::error!("binlog listener failed: {}", e);
            }
        });

        tokio::spawn(binlog::slave::run_slave_heartbeat(
            router.clone(),
            shutdown_rx.clone(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Some(monitor) = &monitor {
        monitor.stop();
    }
    pool.shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    tracing::info!("WolfRelay stopped");
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        tracing::error!("Refusing to overwrite existing file {:?}", output);
        std::process::exit(1);
    }

    let template = format!(
        r#"[node]
id = "{node_id}"
data_dir = "/var/lib/wolfrelay"

[listener]
bind_address = "0.0.0.0:4006"
backend_user = "relay"
backend_password = ""

[[server]]
name = "db1"
address = "127.0.0.1"
port = 3306

[monitor]
servers = ["db1"]
user = "monitor"
password = ""

[binlog]
enabled = false
listen_address = "0.0.0.0:4007"
server_id = 1001
fileroot = "mariadb-bin"
"#
    );
    std::fs::write(&output, template)?;
    tracing::info!("Wrote starter configuration to {:?}", output);
    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfRelayConfig::from_file(&config_path) {
        Ok(config) => {
            tracing::info!("Configuration is valid for node '{}'", config.node.id);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Configuration is invalid: {}", e);
            Err(e)
        }
    }
}

/// Show node information from a configuration file
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfRelayConfig::from_file(&config_path)?;
    println!("Node:        {}", config.node.id);
    println!("Data dir:    {}", config.data_dir().display());
    println!("Listener:    {}", config.listener.bind_address);
    println!("Servers:     {}", config.servers.len());
    for server in &config.servers {
        println!("  - {} ({}:{})", server.name, server.address, server.port);
    }
    println!("Monitor:     {}", if config.monitor.enabled { "enabled" } else { "disabled" });
    println!(
        "Binlog:      {}",
        if config.binlog.enabled {
            config.binlog.listen_address.as_str()
        } else {
            "disabled"
        }
    );
    Ok(())
}
