//! Tunnel Gate
//!
//! Local proxy front-end:
//! - Accepts SOCKS4a, SOCKS5, HTTP and raw connections on one port
//! - Extra ports from `port_map`, optionally pinned or forwarding
//! - Routes by rule to direct, upstream proxy, or the tunnel
//! - Reloads configuration on SIGHUP

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_gate::{
    config::{generate_example_config, Config, LoggingConfig, PortMapConfig},
    protocol::TargetAddr,
    proxy::{standard_handlers, AuthPolicy, ConnectionHandler, ForwardHandler, ProxyListener},
    router::Router,
    ProxyContext, VERSION,
};

/// How often the health summary is logged
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Tunnel Gate - rule-routing local proxy with an obfuscated tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnel-gate")]
#[command(about = "Tunnel Gate - SOCKS/HTTP front-end with rule routing and obfuscated tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config; trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        println!("{}", example);
        return Ok(());
    }

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    if let Some(listen) = &args.listen {
        config.local.listen = listen.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_logging(&config.logging)?;

    info!("Tunnel Gate v{}", VERSION);
    info!(
        "{} server(s), rule mode {:?}, balance {}",
        config.servers.len(),
        config.rules.mode,
        config.balance.algorithm
    );

    let listen_addr = config.local.listen_addr()?;
    let auth = AuthPolicy::new(config.local.credentials());
    let handshake_timeout = Duration::from_secs(config.timeouts.handshake_secs);
    let port_map = config.port_map.clone();

    let ctx = Arc::new(ProxyContext::new(config).context("Failed to build runtime context")?);
    let router = Arc::new(Router::new(Arc::clone(&ctx)));

    let main_listener = ProxyListener::bind(
        listen_addr,
        standard_handlers(auth.clone()),
        router.clone(),
        handshake_timeout,
    )
    .await
    .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let mut listeners = JoinSet::new();
    listeners.spawn(main_listener.run());

    for entry in &port_map {
        let addr: SocketAddr = entry
            .listen
            .parse()
            .with_context(|| format!("Bad port_map address {}", entry.listen))?;
        let listener = ProxyListener::bind(
            addr,
            port_handlers(entry, &auth)?,
            router.clone(),
            handshake_timeout,
        )
        .await
        .with_context(|| format!("Failed to bind port_map {}", addr))?;
        if let Some(target) = &entry.forward {
            info!("Forwarding {} to {}", addr, target);
        }
        if let Some(server) = &entry.server_id {
            info!("Port {} pinned to server {}", addr.port(), server);
        }
        listeners.spawn(listener.run());
    }

    let reload_task = spawn_reload(Arc::clone(&ctx), args.config.clone());
    let report_task = tokio::spawn(report_health(Arc::clone(&ctx)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        _ = listeners.join_next() => {
            error!("A listener stopped unexpectedly");
        }
    }

    let closed = ctx.disconnect_all();
    if closed > 0 {
        info!("Closed {} active session(s)", closed);
    }
    listeners.abort_all();
    reload_task.abort();
    report_task.abort();

    Ok(())
}

/// Install the tracing subscriber described by the logging section
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .map_err(|e| anyhow!("Invalid log level {}: {}", logging.level, e))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let file = match &logging.file {
        Some(path) => Some(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?,
        )),
        None => None,
    };

    match (logging.format.as_str(), file) {
        ("json", Some(file)) => builder.json().with_writer(file).init(),
        ("json", None) => builder.json().init(),
        ("compact", Some(file)) => builder.compact().with_ansi(false).with_writer(file).init(),
        ("compact", None) => builder.compact().init(),
        (_, Some(file)) => builder.with_ansi(false).with_writer(file).init(),
        (_, None) => builder.init(),
    }
    Ok(())
}

/// Handler chain for one `port_map` entry
fn port_handlers(
    entry: &PortMapConfig,
    auth: &AuthPolicy,
) -> Result<Vec<Arc<dyn ConnectionHandler>>> {
    match &entry.forward {
        Some(target) => {
            let target = TargetAddr::parse(target)
                .with_context(|| format!("Bad forward target {}", target))?;
            let forward: Arc<dyn ConnectionHandler> = Arc::new(ForwardHandler::new(target));
            Ok(vec![forward])
        }
        None => Ok(standard_handlers(auth.clone())),
    }
}

/// Reload the configuration file on SIGHUP
#[cfg(unix)]
fn spawn_reload(ctx: Arc<ProxyContext>, path: String) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP reload unavailable: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("Reloading configuration from {}", path);
            match Config::load(&path).and_then(|config| ctx.reload(config)) {
                Ok(()) => info!("Configuration reloaded"),
                Err(e) => error!("Reload failed, keeping previous configuration: {}", e),
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_reload(_ctx: Arc<ProxyContext>, _path: String) -> JoinHandle<()> {
    tokio::spawn(async {})
}

/// Periodically log one line per server
async fn report_health(ctx: Arc<ProxyContext>) {
    let mut interval = tokio::time::interval(HEALTH_REPORT_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        for health in ctx.health_report() {
            debug!(
                "{}: enabled={} active={} total={} errors={} up={}B down={}B latency={:?}ms",
                health.server_id,
                health.enabled,
                health.active_connections,
                health.total_connections,
                health.consecutive_errors,
                health.total_upload,
                health.total_download,
                health.avg_connect_latency_ms,
            );
        }
    }
}
