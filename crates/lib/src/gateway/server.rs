//! Gateway HTTP + WebSocket server (single port).

use crate::accounts::AccountRegistry;
use crate::channels::telegram::{self, TelegramHandle};
use crate::channels::{ChannelRegistry, InboundMessage};
use crate::config::{self, Config};
use crate::dedup::AnsweredSet;
use crate::embedding::EmbeddingClient;
use crate::faq::FaqIndex;
use crate::gateway::protocol::DashboardEvent;
use crate::language::LanguageService;
use crate::llm::{OpenAiClient, RetryPolicy};
use crate::media::{MediaStore, WhisperTranscriber};
use crate::resolver::ReplyResolver;
use crate::sweep;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"shutdown"}"#;

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, dashboard connections must provide a matching `token`
    /// query parameter.
    pub required_token: Option<String>,
    /// Broadcasts dashboard events to connected clients. Fire and forget.
    pub event_tx: broadcast::Sender<String>,
    /// Sender for inbound channel messages (poll loops, webhook POSTs).
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub channels: ChannelRegistry,
    pub accounts: AccountRegistry,
    pub resolver: ReplyResolver,
    /// Directory the /media route serves from.
    pub media_dir: PathBuf,
    /// Telegram handle for webhook ingestion, when Telegram is configured.
    pub telegram: Option<Arc<TelegramHandle>>,
}

/// Process one inbound message: broadcast it to the dashboard, resolve a
/// reply, send it back on the originating channel, broadcast the reply.
async fn process_inbound_message(state: GatewayState, msg: InboundMessage) {
    match &msg.media {
        Some(media) => DashboardEvent::MediaMessage {
            account_id: msg.account_id.clone(),
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id.clone(),
            mime_type: media.mime_type.clone(),
            url: None,
            timestamp: msg.received_at,
        }
        .emit(&state.event_tx),
        None => DashboardEvent::TextMessage {
            account_id: msg.account_id.clone(),
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id.clone(),
            body: msg.body.clone().unwrap_or_default(),
            timestamp: msg.received_at,
        }
        .emit(&state.event_tx),
    }

    let Some(reply) = state.resolver.resolve(&msg).await else {
        return;
    };
    let Some(handle) = state.channels.get(&msg.account_id).await else {
        log::warn!("no channel for account {}, reply dropped", msg.account_id);
        return;
    };
    match handle.send_message(&msg.conversation_id, &reply.text).await {
        Ok(()) => {
            DashboardEvent::Reply {
                account_id: msg.account_id.clone(),
                conversation_id: msg.conversation_id.clone(),
                body: reply.text.clone(),
                source: reply.source.as_str().to_string(),
            }
            .emit(&state.event_tx);
        }
        Err(e) => log::warn!("sending reply to {} failed: {}", msg.conversation_id, e),
    }
}

/// Build the reply pipeline from config.
fn build_resolver(config: &Config, config_path: &std::path::Path) -> ReplyResolver {
    let openai = &config.providers.openai;
    let api_key = config::resolve_openai_key(config);
    let text_timeout = Duration::from_secs(openai.text_timeout_secs);
    let media_timeout = Duration::from_secs(openai.media_timeout_secs);
    let retry = RetryPolicy {
        max_retries: openai.max_retries,
        ..RetryPolicy::default()
    };

    let chat = Arc::new(
        OpenAiClient::new(
            api_key.clone(),
            openai.base_url.clone(),
            openai.chat_model.clone(),
            openai.vision_model.clone(),
        )
        .with_policy(text_timeout, media_timeout, retry.clone()),
    );
    let embedder = Arc::new(
        EmbeddingClient::new(
            api_key.clone(),
            openai.base_url.clone(),
            openai.embedding_model.clone(),
        )
        .with_policy(media_timeout, retry.clone()),
    );
    let transcriber = Arc::new(
        WhisperTranscriber::new(
            api_key,
            openai.base_url.clone(),
            openai.transcription_model.clone(),
        )
        .with_policy(media_timeout, retry),
    );

    let faq = Arc::new(FaqIndex::new(
        config.faq.url.clone().unwrap_or_default(),
        config::resolve_faq_cache_path(config, config_path),
        config.faq.similarity_threshold,
        media_timeout,
        embedder,
    ));
    if config.faq.url.is_none() {
        log::info!("faq.url not set, semantic matching disabled");
    }

    let public_base_url = config.media.public_base_url.clone().unwrap_or_else(|| {
        format!(
            "http://{}:{}/media",
            config.gateway.bind, config.gateway.port
        )
    });
    let media = MediaStore::new(
        config::resolve_media_dir(config, config_path),
        public_base_url,
    );

    ReplyResolver::new(
        Arc::new(AnsweredSet::new()),
        faq,
        LanguageService::new(chat.clone(), config.faq.default_language.clone()),
        chat,
        transcriber,
        media,
        config.faq.pivot_language.clone(),
        config.faq.assistant_prompt.clone(),
    )
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup
/// fails. Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    let required_token = config::resolve_gateway_token(&config);
    if !config::is_loopback_bind(&bind) && required_token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.token or PONTE_GATEWAY_TOKEN)",
            bind
        );
    }

    let (event_tx, _) = broadcast::channel(64);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(64);
    let channels = ChannelRegistry::new();
    let accounts = AccountRegistry::new();
    let resolver = build_resolver(&config, &config_path);

    // Warm the FAQ cache before messages arrive; failures are retried on the
    // next message.
    {
        let resolver = resolver.clone();
        tokio::spawn(async move {
            if let Err(e) = resolver.faq().refresh_if_stale().await {
                log::warn!("initial faq refresh failed: {}", e);
            }
        });
    }

    let telegram_token = config::resolve_telegram_token(&config);
    let telegram = match telegram_token {
        Some(token) => {
            let poll = config.channels.telegram.webhook_secret.is_none();
            let handle = TelegramHandle::start("telegram", token, inbound_tx.clone(), poll);
            channels.register(handle.clone()).await;
            let state = accounts
                .register("telegram", crate::channels::Platform::Telegram)
                .await;
            // Bot API accounts have no initial history sync.
            state.mark_ready();
            log::info!(
                "telegram channel registered ({})",
                if poll { "long-poll" } else { "webhook" }
            );
            Some(handle)
        }
        None => {
            log::info!("telegram bot token not set, channel disabled");
            None
        }
    };

    let state = GatewayState {
        config: Arc::new(config.clone()),
        required_token,
        event_tx: event_tx.clone(),
        inbound_tx,
        channels: channels.clone(),
        accounts: accounts.clone(),
        resolver: resolver.clone(),
        media_dir: config::resolve_media_dir(&config, &config_path),
        telegram,
    };

    // Inbound processor: every message gets its own task, tracked on its
    // account so unregistering cancels it.
    {
        let state_inbound = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                let state = state_inbound.clone();
                let account_id = msg.account_id.clone();
                let task = tokio::spawn(process_inbound_message(state.clone(), msg));
                if let Some(account) = state.accounts.get(&account_id).await {
                    account.track(task).await;
                }
            }
        });
    }

    let sweep_task = sweep::spawn(
        accounts,
        channels.clone(),
        resolver,
        event_tx.clone(),
        Duration::from_secs(config.sweep.interval_secs),
    );

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .route("/webhook/telegram", post(telegram_webhook))
        .route("/media/:name", get(serve_media))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx, channels, sweep_task))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event, stops channel adapters, cancels the sweep.
async fn shutdown_signal(
    event_tx: broadcast::Sender<String>,
    channels: ChannelRegistry,
    sweep_task: JoinHandle<()>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");

    DashboardEvent::Shutdown.emit(&event_tx);
    channels.stop_all().await;
    sweep_task.abort();
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
    }))
}

/// POST /webhook/telegram — receives Telegram update JSON; verifies the
/// secret header, normalizes, pushes onto the inbound queue.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref expected) = state.config.channels.telegram.webhook_secret {
        let provided = headers
            .get("X-Telegram-Bot-Api-Secret-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let Some(ref handle) = state.telegram else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    let update: telegram::Update = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    handle.ingest(update).await;
    StatusCode::OK
}

/// GET /media/:name — serves persisted images for vision calls and the
/// dashboard. Path segments cannot traverse out of the media directory.
async fn serve_media(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Response {
    if name.contains("..") || name.contains('/') {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = state.media_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = match path.extension().and_then(|e| e.to_str()) {
                Some("jpeg") | Some("jpg") => "image/jpeg",
                Some("png") => "image/png",
                Some("gif") => "image/gif",
                Some("webp") => "image/webp",
                _ => "application/octet-stream",
            };
            ([("content-type", mime)], bytes).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws upgrades to the dashboard event stream. Clients only receive;
/// inbound frames are ignored apart from close.
async fn ws_handler(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(ref required) = state.required_token {
        let provided = params.get("token").map(|s| s.trim()).unwrap_or("");
        if provided != required {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut event_rx = state.event_tx.subscribe();
    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}
