use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use quest_server::db::{Database, MemoryKv};
use quest_server::encounter::BlockPos;
use quest_server::quest::{HotReloadEvent, QuestPool};
use quest_server::scheduler::SystemClock;
use quest_server::world::{ResourceHandle, SimWorld};
use quest_server::{ObjectiveEvent, QuestConfig, QuestService, Rejection};

type Service = QuestService<Arc<MemoryKv>, SimWorld>;

// ============================================================================
// App State
// ============================================================================

#[derive(Clone)]
struct AppState {
    service: Arc<Mutex<Service>>,
    kv: Arc<MemoryKv>,
    db: Arc<Database>,
}

impl AppState {
    async fn new(config: QuestConfig) -> Self {
        // Initialize database and pull every stored record into memory
        let db = Database::new(&config.server.database_url)
            .await
            .expect("Failed to initialize database");
        let kv = Arc::new(MemoryKv::new());
        if let Err(e) = db.load_all(&kv).await {
            error!("Failed to load quest records: {}", e);
        }

        // Load quest pools from TOML files
        let data_dir = std::path::PathBuf::from(&config.server.data_dir);
        let pool = QuestPool::load_from_directory(&data_dir).unwrap_or_else(|e| {
            error!("Failed to load quest pools: {}", e);
            QuestPool::new()
        });

        let mut service = QuestService::new(
            config,
            pool,
            kv.clone(),
            SimWorld::new(),
            Box::new(SystemClock),
        );
        service.start();
        let service = Arc::new(Mutex::new(service));

        // Start hot-reload watcher for quest pools (dev mode)
        #[cfg(debug_assertions)]
        {
            match quest_server::quest::start_file_watcher(data_dir) {
                Ok(mut rx) => {
                    let reload_service = service.clone();
                    tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            match event {
                                HotReloadEvent::Reloaded(pool) => {
                                    reload_service.lock().await.replace_pool(pool);
                                    info!("Quest pool hot-reloaded");
                                }
                                HotReloadEvent::Error(e) => {
                                    error!("Quest hot-reload error: {}", e);
                                }
                            }
                        }
                    });
                    info!("Quest hot-reload enabled");
                }
                Err(e) => {
                    warn!("Failed to start quest hot-reload: {}", e);
                }
            }
        }

        Self {
            service,
            kv,
            db: Arc::new(db),
        }
    }

    async fn flush(&self) {
        match self.db.flush(&self.kv).await {
            Ok(0) => {}
            Ok(saved) => info!("Auto-saved {} quest record(s) to database", saved),
            Err(e) => warn!("Auto-save failed: {}", e),
        }
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: Rejection,
}

fn respond<T: Serialize>(result: Result<T, Rejection>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(rejection) => {
            let status = match rejection {
                Rejection::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                Rejection::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                _ => StatusCode::CONFLICT,
            };
            (status, Json(ErrorBody { error: rejection })).into_response()
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp_millis()
    }))
}

/// GET /actors/:id - Current quest state
async fn get_actor(State(state): State<AppState>, Path(actor): Path<String>) -> Response {
    respond(state.service.lock().await.snapshot(&actor))
}

/// POST /actors/:id/connect
async fn connect_actor(State(state): State<AppState>, Path(actor): Path<String>) -> Response {
    respond(state.service.lock().await.on_actor_reconnected(&actor))
}

/// POST /actors/:id/disconnect
async fn disconnect_actor(State(state): State<AppState>, Path(actor): Path<String>) -> Response {
    respond(state.service.lock().await.on_actor_disconnected(&actor))
}

/// POST /actors/:id/accept/:slot
async fn accept_slot(
    State(state): State<AppState>,
    Path((actor, slot)): Path<(String, usize)>,
) -> Response {
    respond(state.service.lock().await.accept_slot(&actor, slot))
}

/// POST /actors/:id/abandon
async fn abandon_quest(State(state): State<AppState>, Path(actor): Path<String>) -> Response {
    respond(state.service.lock().await.abandon_active(&actor))
}

/// POST /actors/:id/reroll
async fn reroll_slots(State(state): State<AppState>, Path(actor): Path<String>) -> Response {
    respond(state.service.lock().await.reroll(&actor))
}

/// POST /actors/:id/redeem
async fn redeem_quest(State(state): State<AppState>, Path(actor): Path<String>) -> Response {
    respond(state.service.lock().await.redeem_active(&actor))
}

#[derive(Deserialize)]
struct PositionRequest {
    x: i32,
    y: i32,
    z: i32,
    #[serde(default = "default_dimension")]
    dimension: String,
}

fn default_dimension() -> String {
    "overworld".to_string()
}

/// POST /actors/:id/position - Proximity sample
async fn report_position(
    State(state): State<AppState>,
    Path(actor): Path<String>,
    Json(req): Json<PositionRequest>,
) -> impl IntoResponse {
    let pos = BlockPos::new(req.x, req.y, req.z);
    let entry = state
        .service
        .lock()
        .await
        .on_actor_position(&actor, pos, &req.dimension);
    Json(serde_json::json!({
        "zone_entered": entry.is_some(),
        "detail": entry.map(|e| format!("{:?}", e)),
    }))
}

/// POST /actors/:id/objective - Standard objective progress
async fn report_objective(
    State(state): State<AppState>,
    Path(actor): Path<String>,
    Json(event): Json<ObjectiveEvent>,
) -> Response {
    let result = state.service.lock().await.on_objective_event(&actor, &event);
    respond(result.map(|progress| serde_json::json!({ "progress": progress })))
}

#[derive(Deserialize)]
struct DamageRequest {
    actor: String,
}

/// POST /resources/:handle/damage
async fn damage_resource(
    State(state): State<AppState>,
    Path(handle): Path<u64>,
    Json(req): Json<DamageRequest>,
) -> impl IntoResponse {
    state
        .service
        .lock()
        .await
        .on_resource_damaged(ResourceHandle(handle), &req.actor);
    StatusCode::NO_CONTENT
}

/// POST /resources/:handle/kill - Kill a resource in the simulated world
async fn kill_resource(State(state): State<AppState>, Path(handle): Path<u64>) -> Response {
    let mut service = state.service.lock().await;
    let Some(death) = service.world_mut().kill(ResourceHandle(handle)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "resource not found" })),
        )
            .into_response();
    };
    Json(service.on_resource_killed(death)).into_response()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quest_server=info".parse().unwrap()),
        )
        .init();

    let config_path = std::env::var("QUEST_CONFIG").unwrap_or_else(|_| "config/quests.toml".to_string());
    let config = QuestConfig::load_from_file(std::path::Path::new(&config_path))
        .expect("Failed to load quest configuration");
    let tick_rate = config.scheduler.tick_rate.max(1) as u64;
    let autosave_secs = config.server.autosave_secs.max(1);
    let bind = config.server.bind.clone();

    let state = AppState::new(config).await;

    // Spawn quest tick loop
    let tick_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(1000 / tick_rate));
        loop {
            interval.tick().await;
            let report = tick_state.service.lock().await.tick();
            if report.orphans_removed > 0 {
                info!("Tick {}: removed {} orphaned resources", report.tick, report.orphans_removed);
            }
        }
    });

    // Spawn auto-save loop
    let save_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(autosave_secs));
        loop {
            interval.tick().await;
            save_state.flush().await;
        }
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/actors/:id", get(get_actor))
        .route("/actors/:id/connect", post(connect_actor))
        .route("/actors/:id/disconnect", post(disconnect_actor))
        .route("/actors/:id/accept/:slot", post(accept_slot))
        .route("/actors/:id/abandon", post(abandon_quest))
        .route("/actors/:id/reroll", post(reroll_slots))
        .route("/actors/:id/redeem", post(redeem_quest))
        .route("/actors/:id/position", post(report_position))
        .route("/actors/:id/objective", post(report_objective))
        .route("/resources/:handle/damage", post(damage_resource))
        .route("/resources/:handle/kill", post(kill_resource))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        )
        .with_state(state.clone());

    let addr: SocketAddr = bind.parse().expect("Invalid bind address");
    info!("Quest server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Offline actors must not keep resources alive
    let disconnected = state.service.lock().await.disconnect_all();
    info!("Disconnected {} actor(s) on shutdown", disconnected);
    state.flush().await;
    state.db.close().await;
}
