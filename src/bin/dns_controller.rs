//! DNS Controller - Standalone Binary
//!
//! Reconciles `DNSRecord` resources against Cloudflare zones. With
//! `--dry-run` everything runs against in-memory stores and providers.

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lornu_dns_controller::controller::{Controller, Reconciler};
use lornu_dns_controller::delegation::{DohTxtLookup, StaticTxtLookup, TxtLookup};
use lornu_dns_controller::provider::{CloudflareProvider, InMemoryProvider, Provider, StaticProviderFactory};
use lornu_dns_controller::store::{ClusterRegistry, InMemoryRecordStore, KubeRecordStore, RecordStore};
use lornu_dns_controller::{ControllerConfig, Policy};

/// DNS Controller - converges DNSRecord resources with many writers per hostname
#[derive(Parser, Debug)]
#[command(name = "dns-controller", version, about)]
struct Args {
    /// JSON config file, applied before flags
    #[arg(long, env = "DNS_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// Identifier of this cluster
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Cloudflare API token
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    cloudflare_token: Option<String>,

    /// Proxy address records through Cloudflare
    #[arg(long, default_value = "false")]
    proxied: bool,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Long validity window in seconds
    #[arg(long, env = "VALID_FOR")]
    valid_for: Option<u64>,

    /// Short validation window in seconds
    #[arg(long, env = "VALIDATION_REQUEUE")]
    validation_requeue: Option<u64>,

    /// sync, upsert-only or create-only
    #[arg(long, env = "DEFAULT_POLICY")]
    policy: Option<Policy>,

    /// Passphrase for provenance encryption
    #[arg(long, env = "TXT_ENCRYPTION_KEY", hide_env_values = true)]
    txt_encryption_key: Option<String>,

    /// DoH endpoints asked for the active-groups record
    #[arg(long, env = "ACTIVE_GROUPS_NAMESERVERS", value_delimiter = ',')]
    nameservers: Vec<String>,

    /// Health endpoint port
    #[arg(long, default_value = "8080", env = "HEALTH_PORT")]
    health_port: u16,

    /// Dry run - in-memory store and provider, nothing leaves the process
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

impl Args {
    fn config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ControllerConfig::default(),
        };

        if let Some(cluster_id) = &self.cluster_id {
            config.cluster_id = cluster_id.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.valid_for {
            config.valid_for = Duration::from_secs(secs);
        }
        if let Some(secs) = self.validation_requeue {
            config.validation_requeue = Duration::from_secs(secs);
        }
        if let Some(policy) = self.policy {
            config.default_policy = policy;
        }
        if let Some(key) = &self.txt_encryption_key {
            config.registry.encryption_key = Some(key.clone());
        }
        if !self.nameservers.is_empty() {
            config.active_groups_nameservers = self.nameservers.clone();
        }

        Ok(config)
    }
}

#[derive(Clone)]
struct HealthState {
    ready: Arc<AtomicBool>,
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lornu-dns-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readyz(State(state): State<HealthState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "status": "starting" })))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();
    let config = args.config()?;

    info!(
        cluster_id = %config.cluster_id,
        workers = config.workers,
        policy = %config.default_policy,
        dry_run = args.dry_run,
        "Starting DNS Controller"
    );

    let (store, provider, lookup): (Arc<dyn RecordStore>, Arc<dyn Provider>, Arc<dyn TxtLookup>) = if args.dry_run {
        (
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryProvider::new()),
            Arc::new(StaticTxtLookup::new()),
        )
    } else {
        let token = args
            .cloudflare_token
            .clone()
            .context("CLOUDFLARE_API_TOKEN must be set unless --dry-run")?;
        let store = KubeRecordStore::try_default()
            .await
            .context("Failed to create Kubernetes record store")?;
        let provider = CloudflareProvider::new(token)
            .context("Failed to create Cloudflare provider")?
            .proxied(args.proxied);
        let lookup = DohTxtLookup::new().context("Failed to create DoH client")?;
        (Arc::new(store), Arc::new(provider), Arc::new(lookup))
    };

    let provider_name = provider.name().to_string();
    let factory = StaticProviderFactory::new()
        .with_provider(&provider_name, provider)
        .with_default(&provider_name);
    let clusters = Arc::new(ClusterRegistry::new(&config.cluster_id));

    let reconciler = Reconciler::new(store, Arc::new(factory), clusters, lookup, config);
    let controller = Controller::new(reconciler);

    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(HealthState { ready: ready.clone() });
    let addr = SocketAddr::from(([0, 0, 0, 0], args.health_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;
    info!("Health endpoint listening on {}", addr);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "Health endpoint failed");
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
        signal_cancel.cancel();
    });

    ready.store(true, Ordering::SeqCst);
    controller.run(cancel).await;
    server.await.context("Health endpoint task panicked")?;

    info!("DNS Controller stopped");
    Ok(())
}
