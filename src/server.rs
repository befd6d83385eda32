//! HTTP and WebSocket server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::cors::{Any, CorsLayer};

use crate::commands;
use crate::AppState;

/// All dashboard routes over shared state
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(commands::get_health))
        .route("/api/dashboard", get(commands::get_dashboard))
        .route("/api/system/overview", get(commands::get_system_overview))
        .route("/api/agents/list", get(commands::get_agents))
        .route("/api/agents/:id/status", get(commands::get_agent_status))
        .route("/api/agents/:id/details", get(commands::get_agent_details))
        .route(
            "/api/agents/:agent_id/sessions/:session_id",
            get(commands::get_session_details),
        )
        .route("/api/tasks/current", get(commands::get_current_tasks))
        .route("/api/tasks/history", get(commands::get_task_history))
        .route("/api/tasks/stats", get(commands::get_tasks_stats))
        .route("/api/tasks/:id/details", get(commands::get_task_details))
        .route("/api/channels/status", get(commands::get_channels_status))
        .route("/api/channels/stats", get(commands::get_channel_stats))
        .route("/api/logs/recent", get(commands::get_recent_logs))
        .route("/api/logs/analyze", get(commands::analyze_logs))
        .route("/api/metrics/history", get(commands::get_metrics_history))
        .route("/api/health/history", get(commands::get_health_history))
        .route("/api/models/stats", get(commands::get_models_stats))
        .route("/api/models/usage", get(commands::get_model_usage))
        .route(
            "/api/alerts/rules",
            get(commands::get_alert_rules).post(commands::set_alert_rules),
        )
        .route("/api/alerts/history", get(commands::get_alert_history))
        .route("/api/alerts/active", get(commands::get_active_alerts))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Dashboard listening on http://{}", addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Dashboard shutting down");
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let updates = state.updates.subscribe();
    ws.on_upgrade(move |socket| forward_updates(socket, updates))
}

/// Relay push messages to one client until either side closes
async fn forward_updates(socket: WebSocket, mut updates: broadcast::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();
    debug!("WebSocket client connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagging, skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Inbound traffic is ignored, only close matters
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("WebSocket client disconnected");
}
