//! Coordinator binary: configuration, wiring, and lifecycle.

use std::collections::HashMap;
use std::future::IntoFuture as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser as _;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mixnet_common::config::{self, Config};
use mixnet_common::crypto;
use mixnet_common::version::Version;
use mixnet_storage::Storage;

use mixnet_coordinator::cli::Cli;
use mixnet_coordinator::ndf::{NetworkDefinition, RegistrationContact};
use mixnet_coordinator::registration::{
    load_registration_info, populate_node_registration_codes, restore_registered_nodes,
    RateLimiter,
};
use mixnet_coordinator::{
    api, disabled, node_metrics, scheduler, NetworkState, RoundTracker, ServerContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref());

    let cfg = if cli.config.exists() {
        config::load_from_file(&cli.config)
            .with_context(|| format!("loading config from {}", cli.config.display()))?
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    let storage = Storage::new_map();

    // Seed one-time node registration codes.
    if let Some(path) = &cfg.node_registration_codes_path {
        let infos = load_registration_info(path)
            .with_context(|| format!("loading registration codes from {}", path.display()))?;
        populate_node_registration_codes(&storage, &infos);
        info!(count = infos.len(), "seeded node registration codes");
    }

    let rsa_key = load_or_create_rsa_key(&cfg)?;

    let geo_bins: HashMap<String, u8> = storage
        .get_bins()
        .context("loading geographic bins")?
        .into_iter()
        .map(|bin| (bin.country, bin.bin))
        .collect();

    let state = NetworkState::new(
        rsa_key,
        cfg.address_space_size,
        &cfg.full_ndf_output_path,
        &cfg.signed_partial_ndf_output_path,
        geo_bins,
        storage.clone(),
    )
    .await
    .context("constructing network state")?;

    // The ephemeral id length table is authoritative for the address space
    // size; seed it from config on first start.
    match storage.get_latest_ephemeral_length() {
        Ok(length) => state.set_address_space_size(length.length as u32),
        Err(mixnet_storage::StorageError::NotFound(_)) => {
            storage
                .insert_ephemeral_length(mixnet_storage::EphemeralLength {
                    length: cfg.address_space_size as u8,
                    timestamp: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos() as u64)
                        .unwrap_or(0),
                })
                .context("seeding ephemeral length")?;
        }
        Err(err) => return Err(err).context("loading ephemeral lengths"),
    }

    let min_gateway_version = parse_version(cfg.min_gateway_version.as_deref())?;
    let min_server_version = parse_version(cfg.min_server_version.as_deref())?;

    let ctx = Arc::new(ServerContext {
        state: Arc::clone(&state),
        storage: storage.clone(),
        min_gateway_version,
        min_server_version,
        client_limiter: RateLimiter::new(
            cfg.client_registration_cap,
            Duration::from_millis(cfg.client_registration_window_ms),
        ),
    });

    // Seed the canonical NDF with the permissioning contact blocks and any
    // nodes registered in a previous run, then publish.
    state.update_internal_ndf(NetworkDefinition {
        registration: RegistrationContact {
            address: cfg.public_addr.clone(),
            tls_certificate: String::new(),
        },
        udb: cfg.udb.clone(),
        cmix: cfg.cmix.clone(),
        e2e: cfg.e2e.clone(),
        ..Default::default()
    });
    let restored = restore_registered_nodes(&ctx).context("restoring registered nodes")?;
    if restored > 0 {
        info!(count = restored, "restored registered nodes from storage");
    }
    state.update_output_ndf().context("publishing initial NDF")?;
    state.set_ndf_ready();

    // Scheduler.
    let tracker = RoundTracker::new();
    let (kill_tx, kill_rx) = mpsc::channel::<oneshot::Sender<()>>(1);
    let close_timeout = Duration::from_millis(cfg.close_timeout_ms);
    let mut scheduler_handle = tokio::spawn(scheduler::run(
        cfg.scheduling.clone(),
        Arc::clone(&state),
        tracker.clone(),
        kill_rx,
        close_timeout,
    ));

    // Background trackers.
    let mut disabled_quit_tx = None;
    if let Some(path) = cfg.disabled_nodes_path.clone() {
        let (quit_tx, quit_rx) = mpsc::channel::<()>(1);
        disabled_quit_tx = Some(quit_tx);
        tokio::spawn(disabled::poll_disabled_nodes(
            Arc::clone(&state),
            path,
            Duration::from_millis(cfg.disabled_nodes_poll_interval_ms),
            quit_rx,
        ));
    }
    let (metrics_quit_tx, metrics_quit_rx) = mpsc::channel::<()>(1);
    tokio::spawn(node_metrics::track_node_metrics(
        Arc::clone(&state),
        Duration::from_millis(cfg.node_metric_interval_ms),
        Duration::from_millis(cfg.node_stale_after_ms),
        metrics_quit_rx,
    ));

    // HTTP endpoints.
    let router = api::build_router(ctx);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "permissioning server listening");

    tokio::select! {
        result = axum::serve(listener, router).into_future() => {
            result.context("http server failed")?;
        }
        result = &mut scheduler_handle => {
            match result {
                Ok(Ok(())) => info!("scheduler exited"),
                Ok(Err(err)) => {
                    error!(%err, "scheduler failed");
                    return Err(err.into());
                }
                Err(err) => return Err(err).context("scheduler task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let (reply_tx, reply_rx) = oneshot::channel();
            if kill_tx.send(reply_tx).await.is_ok() {
                if tokio::time::timeout(close_timeout, reply_rx).await.is_err() {
                    warn!("scheduler did not confirm shutdown in time");
                }
            }
            if let Some(quit_tx) = &disabled_quit_tx {
                let _ = quit_tx.send(()).await;
            }
            let _ = metrics_quit_tx.send(()).await;
        }
    }

    Ok(())
}

fn init_tracing(cli_filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_version(version: Option<&str>) -> anyhow::Result<Option<Version>> {
    version
        .map(|v| v.parse::<Version>().with_context(|| format!("parsing version {v:?}")))
        .transpose()
}

/// Load the persisted RSA signing key, or generate one on first start.
fn load_or_create_rsa_key(cfg: &Config) -> anyhow::Result<rsa::RsaPrivateKey> {
    let Some(path) = &cfg.rsa_key_path else {
        warn!("no rsa_key_path configured, generating an ephemeral signing key");
        return crypto::generate_rsa_key(crypto::RSA_KEY_BITS).map_err(Into::into);
    };

    if path.exists() {
        let stored = std::fs::read_to_string(path)
            .with_context(|| format!("reading rsa key from {}", path.display()))?;
        return crypto::rsa_key_from_hex(stored.trim()).map_err(Into::into);
    }

    info!(path = %path.display(), "generating new rsa signing key");
    let key = crypto::generate_rsa_key(crypto::RSA_KEY_BITS)?;
    std::fs::write(path, crypto::rsa_key_to_hex(&key)?)
        .with_context(|| format!("writing rsa key to {}", path.display()))?;
    Ok(key)
}
