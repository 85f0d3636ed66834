//! fedcore binary entry point
//!
//! ```text
//! fedcore                       run delivery workers until Ctrl-C
//! fedcore keygen                print a fresh RSA keypair
//! fedcore resolve <reference>   resolve (and store) an actor, print it as JSON
//! ```

use std::sync::Arc;
use std::time::Duration;

use fedcore::federation::{self, ResolutionPolicy, TracingObserver};
use fedcore::{FederationState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging from the `logging` section
/// 3. Initialize metrics
/// 4. Dispatch the requested command
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging; RUST_LOG overrides the configured level
    init_tracing(&config.logging);

    // 3. Initialize metrics
    fedcore::metrics::init_metrics();

    tracing::info!(
        base_url = %config.server.base_url(),
        "Configuration loaded"
    );

    // 4. Dispatch
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run(config).await?,
        Some("keygen") => {
            let keys = federation::generate_keypair_with_bits(config.keys.rsa_bits)?;
            println!("{}", keys.private_key_pem);
            println!("{}", keys.public_key_pem);
        }
        Some("resolve") => {
            let reference = args.get(1).ok_or("usage: fedcore resolve <reference>")?;
            let (state, _receiver) = FederationState::new(config).await?;
            let record = state
                .resolve(reference, &ResolutionPolicy::create_if_not_found())
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Some(other) => return Err(format!("unknown command: {}", other).into()),
    }

    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.default_filter().into());

    if logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

/// Run delivery workers and cache maintenance until Ctrl-C.
async fn run(config: config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting fedcore...");

    let (state, receiver) = FederationState::new(config).await?;
    let pool = state.spawn_delivery_workers(receiver, Arc::new(TracingObserver));
    let pruner = spawn_cache_prune_task(state.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    pruner.abort();
    pool.shutdown().await;

    Ok(())
}

/// Spawn background cache pruning task
fn spawn_cache_prune_task(state: FederationState) -> tokio::task::JoinHandle<()> {
    let interval_secs = state.config.resolution.cache_ttl_seconds.max(60);

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            let removed = state.resolution_cache.prune_expired().await;
            tracing::debug!(removed, "Resolution cache pruned");
        }
    });

    tracing::info!("Cache prune task spawned");
    handle
}
