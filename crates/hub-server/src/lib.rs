// SPDX-License-Identifier: MIT OR Apache-2.0
//! Axum application wiring for the coordination hub daemon: shared state,
//! the tool-dispatch route, the artifact side channel, and the SSE push
//! endpoint.
#![deny(unsafe_code)]

pub mod api;
pub mod validation;

use axum::{
    Router,
    routing::{get, post},
};
use hub_artifacts::{ArtifactStore, TicketIssuer};
use hub_blob::BlobStore;
use hub_board::TaskBoard;
use hub_claim::ClaimEngine;
use hub_config::HubConfig;
use hub_consensus::ConsensusResolver;
use hub_context::ContextStore;
use hub_gate::DoneGate;
use hub_maintenance::MaintenanceRunner;
use hub_messages::MessageBus;
use hub_registry::AgentRegistry;
use hub_store::Store;
use hub_telemetry::{KpiCounters, TransportCounters};
use hub_watermark::ClockWatermarks;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Everything a request handler needs, cloned cheaply per request.
///
/// Every component crate here is `Clone` over a shared `Store`/pool, so
/// cloning `AppState` never duplicates the database connection. The two
/// exceptions ([`TicketIssuer`] and [`ClockWatermarks`]) hold their own
/// interior mutability and are wrapped in `Arc` instead.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: HubConfig,
    pub registry: AgentRegistry,
    pub board: TaskBoard,
    pub claims: ClaimEngine,
    pub gate: DoneGate,
    pub messages: MessageBus,
    pub context: ContextStore,
    pub consensus: ConsensusResolver,
    pub blobs: BlobStore,
    pub artifacts: ArtifactStore,
    pub tickets: Arc<TicketIssuer>,
    pub watermarks: Arc<ClockWatermarks>,
    pub maintenance: Arc<MaintenanceRunner>,
    pub kpi: Arc<KpiCounters>,
    pub transport: Arc<TransportCounters>,
    pub artifact_root: PathBuf,
}

impl AppState {
    /// Wires every component crate over a single [`Store`], building two
    /// independent [`ClockWatermarks`] caches: one for the request/SSE read
    /// path, one owned by the maintenance loop. The cache TTL (tens of
    /// milliseconds) bounds how stale a cross-instance read can get, so the
    /// split costs nothing the freshness guarantees notice.
    pub fn new(store: Store, config: HubConfig, artifact_root: PathBuf) -> AppState {
        let registry = AgentRegistry::new(store.clone());
        let board = TaskBoard::new(store.clone(), registry.clone());
        let gate = DoneGate::new(store.clone(), registry.clone(), config.clone());
        let claims = ClaimEngine::new(store.clone(), registry.clone(), gate.clone());
        let messages = MessageBus::new(store.clone(), config.max_message_content_chars);
        let context = ContextStore::new(store.clone(), config.max_context_value_chars);
        let blobs = BlobStore::new(store.clone());
        let consensus = ConsensusResolver::new(
            store.clone(),
            blobs.clone(),
            registry.clone(),
            config.max_consensus_votes,
        );
        let artifacts = ArtifactStore::new(store.clone());
        let watermarks = Arc::new(ClockWatermarks::new(
            store.clone(),
            config.watermark_cache,
            config.watermark_agent_cache_max,
        ));
        let maintenance_watermarks = ClockWatermarks::new(
            store.clone(),
            config.watermark_cache,
            config.watermark_agent_cache_max,
        );
        let maintenance = Arc::new(MaintenanceRunner::new(
            store.clone(),
            registry.clone(),
            board.clone(),
            claims.clone(),
            blobs.clone(),
            artifacts.clone(),
            maintenance_watermarks,
            config.clone(),
        ));

        AppState {
            store,
            config,
            registry,
            board,
            claims,
            gate,
            messages,
            context,
            consensus,
            blobs,
            artifacts,
            tickets: Arc::new(TicketIssuer::new()),
            watermarks,
            maintenance,
            kpi: Arc::new(KpiCounters::new()),
            transport: Arc::new(TransportCounters::new()),
            artifact_root,
        }
    }
}

/// Build the Axum router with all daemon routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::get_health))
        .route("/tools/{tool}", post(api::dispatch_tool))
        .route("/artifacts/upload/{id}", post(api::upload_artifact))
        .route("/artifacts/download/{id}", get(api::download_artifact))
        .route("/events", get(api::stream_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs [`MaintenanceRunner::run_once`] on `config.maintenance_interval`
/// until the process exits. Intended to be spawned once at startup.
pub async fn run_maintenance_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.config.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        match state.maintenance.run_once(now).await {
            Ok(report) => {
                if !report.slo_alerts_raised.is_empty() {
                    info!(codes = ?report.slo_alerts_raised, "maintenance raised slo alerts");
                }
                info!(
                    expired_claims_cleared = report.expired_claims_cleared,
                    agents_marked_offline = report.agents_marked_offline,
                    tasks_archived = report.tasks_archived,
                    "maintenance sweep complete"
                );
            }
            Err(err) => error!(error = %err, "maintenance sweep failed"),
        }
    }
}

/// How long a `poll_and_claim` call must wait after the previous one before
/// it is allowed to run expired-claim cleanup again, unless the caller set
/// `force_cleanup: true`.
pub const CLAIM_CLEANUP_THROTTLE: Duration = Duration::from_secs(5);
