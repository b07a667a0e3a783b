use clap::Parser;
use nostr_relay::admin::{AdminContext, admin_route};
use nostr_relay::relay_info::RelayInfo;
use nostr_relay::{Config, RelayMetrics, RelayServer, register_builtin_drivers};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warp::Filter;

#[derive(Debug, Parser)]
#[command(name = "nostr-relay", about = "Nostr relay with SQLite persistence")]
struct Args {
    /// Path to a key = value config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the WebSocket listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the HTTP listen address (NIP-11 and admin RPC)
    #[arg(long)]
    http_listen: Option<SocketAddr>,

    /// Override the storage URI
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(http_listen) = args.http_listen {
        config.http_listen = http_listen;
    }
    if let Some(db) = args.db {
        config.storage_uri = db;
    }
    let config = Arc::new(config);

    register_builtin_drivers();
    let store = match nostr_relay::create_driver(&config.storage_driver, &config.storage_uri) {
        None => {
            error!("unknown storage driver '{}'", config.storage_driver);
            std::process::exit(2);
        }
        Some(Err(e)) => {
            error!("cannot open storage '{}': {}", config.storage_uri, e);
            std::process::exit(1);
        }
        Some(Ok(store)) => store,
    };

    let admin_policy = match nostr_relay::admin::load_policy(&config) {
        Ok(policy) => Arc::new(RwLock::new(policy)),
        Err(e) => {
            error!("cannot load policy file '{}': {}", config.policy_file, e);
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(RelayMetrics::new());
    let server = RelayServer::new(
        Arc::clone(&config),
        store,
        Arc::clone(&admin_policy),
        Arc::clone(&metrics),
    );

    // NIP-11 document, rebuilt per request so admin overrides show up.
    let info_config = Arc::clone(&config);
    let info_policy = Arc::clone(&admin_policy);
    let info_route = warp::get()
        .and(warp::path::end())
        .map(move || {
            let snapshot = info_policy
                .read()
                .map(|p| p.clone())
                .unwrap_or_default();
            warp::reply::json(&RelayInfo::build(&info_config, &snapshot))
        })
        .with(warp::reply::with::header(
            "Access-Control-Allow-Origin",
            "*",
        ));

    let rpc = admin_route(AdminContext::new(
        Arc::clone(&config),
        admin_policy,
        metrics,
    ));
    let http = warp::serve(info_route.or(rpc)).run(config.http_listen);
    info!("http listening on {}", config.http_listen);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("relay server failed: {}", e);
                std::process::exit(1);
            }
        }
        _ = http => {}
        _ = shutdown_signal() => {
            info!("shutting down");
            std::process::exit(0);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
