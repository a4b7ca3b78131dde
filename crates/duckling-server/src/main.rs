mod config;
mod logging;
mod routes;

use std::{collections::VecDeque, sync::Arc, time::Instant};

use axum::{
    routing::{get, post},
    Router,
};
use duckling_agent::{amp::AmpBackend, openai::OpenaiBackend, OpenaiLlm};
use duckling_core::{
    agent::AssistantBridge,
    db::Db,
    engine::Engine,
    events::EventBus,
    executor::TaskExecutor,
    hosted_vcs::{GitHubClient, HostedVcsClient},
    llm::LlmUtility,
    settings::Settings,
    types::CodingTool,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use config::Config;

/// Everything a route handler needs: the durable store directly for reads,
/// and the engine for every state-changing operation.
pub struct AppState {
    pub db: Arc<Db>,
    pub engine: Arc<Engine>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "duckling_server=info,duckling_core=info,duckling_agent=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer { tx: log_tx.clone(), ring: Arc::clone(&log_ring) })
        .init();

    let config = Config::from_env();

    let db = Arc::new(Db::open(&config.store_path)?);
    config.seed_settings(&db)?;

    let settings = Settings::new(&db);
    let events = Arc::new(EventBus::new());
    let executor = TaskExecutor::spawn();

    let hosted_vcs: Arc<dyn HostedVcsClient> = Arc::new(GitHubClient::new(settings.github_token(), settings.max_retries()));

    let mut bridge = AssistantBridge::new();
    bridge.register(CodingTool::Amp, Arc::new(AmpBackend::new(config.amp_bin.clone(), settings.amp_api_key())));
    bridge.register(CodingTool::Openai, Arc::new(OpenaiBackend::new(config.openai_bin.clone(), settings.openai_api_key())));

    let llm: Arc<dyn LlmUtility> = Arc::new(OpenaiLlm::new(settings.openai_api_key(), config.llm_model.clone()));

    let engine = Arc::new(Engine::new(db.clone(), executor, events, hosted_vcs, Arc::new(bridge), llm));

    // Scheduler tick loop. An inner spawn isolates a panicking tick from
    // killing the loop, matching the engine's own tolerance for per-task
    // failures: one bad tick must not stop the next one from firing.
    {
        let engine = Arc::clone(&engine);
        let tick_interval = config.tick_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_interval));
            loop {
                interval.tick().await;
                let engine = Arc::clone(&engine);
                let handle = tokio::spawn(async move { engine.tick().await });
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("scheduler tick error: {e}"),
                    Err(join_err) => error!("scheduler tick panicked: {join_err}"),
                }
            }
        });
    }

    let state = Arc::new(AppState { db, engine, start_time: Instant::now(), log_tx, log_ring });

    let app = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .route("/api/repositories", get(routes::list_repositories).post(routes::register_repository))
        .route("/api/precommit-checks", get(routes::list_precommit_checks).post(routes::add_precommit_check))
        .route("/api/settings", get(routes::get_settings).put(routes::put_settings))
        .route("/api/tasks", get(routes::list_tasks).post(routes::create_task))
        .route("/api/tasks/:id", get(routes::get_task))
        .route("/api/tasks/:id/logs", get(routes::get_task_logs))
        .route("/api/tasks/:id/outputs", get(routes::get_task_outputs))
        .route("/api/tasks/:id/cancel", post(routes::cancel_task))
        .route("/api/tasks/:id/retry", post(routes::retry_task))
        .route("/api/tasks/:id/complete", post(routes::mark_complete))
        .route("/api/events", get(routes::sse_task_updates))
        .route("/api/logs", get(routes::sse_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.bind_addr, config.bind_port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
