//! HTTP/WebSocket surface (§6 External Interfaces).
//!
//! Three concerns share this module: the two carrier WebSocket endpoints
//! that hand off into a [`CallSession`], and the HTTP control surface for
//! campaigns and carrier status callbacks. Placing an actual outbound call
//! through a carrier's REST API is an external collaborator this crate
//! never calls directly (§1 Non-goals); the campaign dispatcher here only
//! tracks admission and in-flight bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::adapter::carrier_a::CarrierAAdapter;
use crate::adapter::carrier_b::CarrierBAdapter;
use crate::adapter::{OutboundWire, WireFrame};
use crate::config::RuntimeConfig;
use crate::gateway::{build_setup_context, ModelGateway, SetupMessage};
use crate::hedge::{FillerLibrary, HedgeEngine, Language};
use crate::limiter::RateLimiter;
use crate::orchestrator::call_session::{CallSession, CallSessionContext, ModelSetup};
use crate::orchestrator::campaign::{Campaign, CallOutcome};
use crate::persistence::PersistencePort;
use crate::types::{AgentConfig, CacheHandle, Carrier, Direction};

/// Everything about a call the carrier hasn't connected its media
/// WebSocket for yet, keyed by the carrier's call identifier.
#[derive(Clone)]
struct PendingCall {
    agent_id: String,
    lead_id: Option<String>,
    direction: Direction,
    agent_config: AgentConfig,
    campaign_id: Option<String>,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<RuntimeConfig>,
    pub persistence: Arc<dyn PersistencePort>,
    pub filler_library: Arc<FillerLibrary>,
    campaigns: Arc<Mutex<HashMap<String, Campaign>>>,
    pending_calls: Arc<Mutex<HashMap<String, PendingCall>>>,
    campaign_rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl ServerState {
    pub fn new(config: RuntimeConfig, persistence: Arc<dyn PersistencePort>) -> Self {
        let campaign_rate_limiter = Arc::new(Mutex::new(RateLimiter::new(config.rate_limiter_config())));
        let filler_library = filler_library_from_env().unwrap_or_else(FillerLibrary::empty_stub);
        Self {
            config: Arc::new(config),
            persistence,
            filler_library: Arc::new(filler_library),
            campaigns: Arc::new(Mutex::new(HashMap::new())),
            pending_calls: Arc::new(Mutex::new(HashMap::new())),
            campaign_rate_limiter,
        }
    }
}

/// Loads pre-recorded filler clips from `FILLER_LIBRARY_DIR` if it's set and
/// readable; falls back silently so a deployment without real clips still
/// starts (§4.5 hedge engine has no hard dependency on real audio).
fn filler_library_from_env() -> Option<FillerLibrary> {
    let dir = std::env::var("FILLER_LIBRARY_DIR").ok()?;
    match FillerLibrary::load_from_dir(std::path::Path::new(&dir)) {
        Ok(library) => Some(library),
        Err(e) => {
            warn!(error = %e, dir, "failed to load filler library, falling back to silent stub");
            None
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/media-stream/{call_sid}", get(carrier_a_ws_handler))
        .route("/media-stream", get(carrier_b_ws_handler))
        .route("/campaigns", post(create_campaign_handler))
        .route("/campaigns/{id}/pause", post(pause_campaign_handler))
        .route("/campaigns/{id}/resume", post(resume_campaign_handler))
        .route("/campaigns/{id}/stop", post(stop_campaign_handler))
        .route("/twilio/voice", post(twilio_voice_handler))
        .route("/twilio/status", post(twilio_status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start(host: &str, port: u16, state: ServerState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(%addr, "binding call runtime server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// --- Carrier WebSockets ------------------------------------------------

/// How long a carrier's media WebSocket may sit connected without a
/// matching `CallSession` registered in `pending_calls` before it's
/// closed with reason `session-timeout` (§4.3, §6).
const PENDING_CALL_REGISTRATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
const PENDING_CALL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// Polls `pending_calls` for up to [`PENDING_CALL_REGISTRATION_TIMEOUT`],
/// since the carrier can connect its media socket before this crate's own
/// call-setup bookkeeping has registered the matching entry.
async fn await_pending_call(state: &ServerState, key: &str) -> Option<PendingCall> {
    let deadline = tokio::time::Instant::now() + PENDING_CALL_REGISTRATION_TIMEOUT;
    loop {
        if let Some(pending) = state.pending_calls.lock().unwrap().remove(key) {
            return Some(pending);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(PENDING_CALL_POLL_INTERVAL).await;
    }
}

/// Closes an already-upgraded WebSocket with close code 1000 and reason
/// `session-timeout`, for a carrier socket whose call never registered
/// within the window (§4.3/§6).
async fn close_with_session_timeout(mut socket: WebSocket, key: &str) {
    warn!(%key, "carrier connected with unknown call id and it never registered within 60s");
    let _ = socket
        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: 1000,
            reason: "session-timeout".into(),
        })))
        .await;
}

async fn carrier_a_ws_handler(
    Path(call_sid): Path<String>,
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match await_pending_call(&state, &call_sid).await {
            Some(pending) => run_carrier_a_session(socket, call_sid, pending, state).await,
            None => close_with_session_timeout(socket, &call_sid).await,
        }
    })
}

#[derive(Debug, Deserialize)]
struct CarrierBQuery {
    call_id: String,
}

async fn carrier_b_ws_handler(
    axum::extract::Query(query): axum::extract::Query<CarrierBQuery>,
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match await_pending_call(&state, &query.call_id).await {
            Some(pending) => run_carrier_b_session(socket, query.call_id, pending, state).await,
            None => close_with_session_timeout(socket, &query.call_id).await,
        }
    })
}

async fn run_carrier_a_session(socket: WebSocket, call_id: String, pending: PendingCall, state: ServerState) {
    let adapter = CarrierAAdapter::new();
    run_session(socket, call_id, Carrier::A, adapter, pending, state).await;
}

async fn run_carrier_b_session(socket: WebSocket, call_id: String, pending: PendingCall, state: ServerState) {
    let adapter = CarrierBAdapter::new();
    run_session(socket, call_id, Carrier::B, adapter, pending, state).await;
}

async fn run_session<A>(socket: WebSocket, call_id: String, carrier: Carrier, adapter: A, pending: PendingCall, state: ServerState)
where
    A: crate::adapter::ProviderAdapter + 'static,
{
    let (ws_sink_tx, ws_sink_rx) = mpsc::channel::<OutboundWire>(64);
    let (carrier_in_tx, carrier_in_rx) = mpsc::channel::<WireFrame>(64);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let forward_out = tokio::spawn(async move {
        let mut ws_sink_rx = ws_sink_rx;
        while let Some(wire) = ws_sink_rx.recv().await {
            let msg = match wire {
                OutboundWire::Text(t) => WsMessage::Text(t.into()),
                OutboundWire::Binary(b) => WsMessage::Binary(b.into()),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let forward_in = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let wire = match msg {
                WsMessage::Text(t) => Some(WireFrame::Text(t.to_string())),
                WsMessage::Binary(b) => Some(WireFrame::Binary(b.to_vec())),
                WsMessage::Close(_) => None,
                _ => continue,
            };
            match wire {
                Some(wire) => {
                    if carrier_in_tx.send(wire).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    let mut gateway = ModelGateway::new(state.config.model_gateway.endpoint.clone());
    let cache_handle = match pending.agent_config.cache_handle.as_deref() {
        Some(raw) => {
            let parsed = CacheHandle::parse(raw);
            if parsed.is_none() {
                warn!(%call_id, raw, "agent config carries a malformed cache handle, falling back to inline prompt");
                gateway.record_malformed_cache_handle();
            }
            parsed
        }
        None => None,
    };
    let setup_context = build_setup_context(
        cache_handle.as_ref(),
        &pending.agent_config.prompt,
        &pending.agent_config.knowledge_documents,
    );
    let setup_message = SetupMessage::new(
        state.config.model_gateway.model.clone(),
        state.config.model_gateway.voice.clone(),
        setup_context,
        pending.agent_config.speech_settings.voice_speed,
    );
    let setup = ModelSetup { endpoint: state.config.model_gateway.endpoint.clone(), setup_message };

    let ctx = CallSessionContext {
        call_id: call_id.clone(),
        direction: pending.direction,
        carrier,
        agent_id: pending.agent_id.clone(),
        lead_id: pending.lead_id.clone(),
        agent_config: pending.agent_config.clone(),
    };

    let hedge = HedgeEngine::new(state.filler_library.clone(), Language::English);
    let mut session = CallSession::new(ctx, adapter, gateway, hedge, state.persistence.clone(), state.config.timeout_config());

    let end_reason = session.run(setup, carrier_in_rx, ws_sink_tx).await;
    info!(%call_id, ?end_reason, "call session ended");

    if let Some(campaign_id) = pending.campaign_id {
        reconcile_campaign(&state, &campaign_id, &call_id, &end_reason);
    }

    forward_out.abort();
    forward_in.abort();
}

fn reconcile_campaign(state: &ServerState, campaign_id: &str, lead_id: &str, end_reason: &crate::orchestrator::EndReason) {
    let outcome = match end_reason {
        crate::orchestrator::EndReason::Hangup | crate::orchestrator::EndReason::Silence => CallOutcome::Completed,
        _ => CallOutcome::Failed,
    };
    let mut campaigns = state.campaigns.lock().unwrap();
    if let Some(campaign) = campaigns.get_mut(campaign_id) {
        campaign.reconcile(lead_id, outcome);
    }
}

// --- Campaign control surface ------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCampaignRequest {
    agent_id: String,
    lead_ids: Vec<String>,
    #[allow(dead_code)]
    campaign_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCampaignResponse {
    campaign_id: String,
    estimated_time_sec: u64,
}

async fn create_campaign_handler(
    State(state): State<ServerState>,
    Json(req): Json<CreateCampaignRequest>,
) -> Response {
    if state.config.public_base_url.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "public base url is not configured").into_response();
    }
    if req.lead_ids.is_empty() {
        return (StatusCode::BAD_REQUEST, "no leads provided").into_response();
    }
    let check = state
        .campaign_rate_limiter
        .lock()
        .unwrap()
        .check_and_record(&req.agent_id, std::time::Instant::now());
    if !check.allowed {
        return (StatusCode::TOO_MANY_REQUESTS, "campaign creation rate limit exceeded").into_response();
    }
    let campaign_id = format!("campaign-{}", uuid::Uuid::new_v4());
    // No account/user model exists in this runtime (§1 Non-goals); the
    // requesting agent doubles as the owning identity.
    let campaign = Campaign::new(campaign_id.clone(), req.agent_id.clone(), req.agent_id.clone(), req.lead_ids.clone());
    let estimated_time_sec = (req.lead_ids.len() as u64).div_ceil(5) * 60;
    state.campaigns.lock().unwrap().insert(campaign_id.clone(), campaign);
    Json(CreateCampaignResponse { campaign_id, estimated_time_sec }).into_response()
}

async fn pause_campaign_handler(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    with_campaign(&state, &id, |c| c.pause())
}

async fn resume_campaign_handler(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    with_campaign(&state, &id, |c| c.resume())
}

async fn stop_campaign_handler(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    with_campaign(&state, &id, |c| c.stop())
}

fn with_campaign(state: &ServerState, id: &str, f: impl FnOnce(&mut Campaign)) -> Response {
    let mut campaigns = state.campaigns.lock().unwrap();
    match campaigns.get_mut(id) {
        Some(c) => {
            f(c);
            StatusCode::OK.into_response()
        }
        None => (StatusCode::NOT_FOUND, "unknown campaign").into_response(),
    }
}

// --- Carrier callbacks ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct TwilioVoiceForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
}

async fn twilio_voice_handler(
    State(state): State<ServerState>,
    axum::extract::Form(form): axum::extract::Form<TwilioVoiceForm>,
) -> Response {
    // Looking up which agent answers an inbound number is an external
    // routing concern (§1 Non-goals: agent CRUD is out of scope); a real
    // deployment resolves `agent_config` from its own agent store here.
    let pending = PendingCall {
        agent_id: "default-agent".to_string(),
        lead_id: None,
        direction: Direction::Inbound,
        agent_config: AgentConfig::default(),
        campaign_id: None,
    };
    state.pending_calls.lock().unwrap().insert(form.call_sid.clone(), pending);
    let ws_url = format!(
        "{}/media-stream/{}",
        state.config.public_base_url.replace("https://", "wss://").replace("http://", "ws://"),
        form.call_sid
    );
    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{ws_url}" /></Connect></Response>"#
    );
    ([("content-type", "text/xml")], twiml).into_response()
}

#[derive(Debug, Deserialize)]
struct TwilioStatusForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "CallStatus")]
    call_status: String,
}

async fn twilio_status_handler(
    State(state): State<ServerState>,
    axum::extract::Form(form): axum::extract::Form<TwilioStatusForm>,
) -> Response {
    let outcome = match form.call_status.as_str() {
        "completed" => CallOutcome::Completed,
        "no-answer" => CallOutcome::NoAnswer,
        "busy" | "failed" | "canceled" => CallOutcome::Failed,
        _ => CallOutcome::Missed,
    };
    // Placing the actual outbound call is an external collaborator this
    // crate never invokes (§1 Non-goals); when it happens elsewhere, the
    // lead ID is expected to double as the carrier's call SID so status
    // callbacks reconcile against the same identifier admitted by
    // `Campaign::admit_next`.
    let mut campaigns = state.campaigns.lock().unwrap();
    for campaign in campaigns.values_mut() {
        if campaign.is_attempted(&form.call_sid) {
            campaign.reconcile(&form.call_sid, outcome);
            break;
        }
    }
    StatusCode::OK.into_response()
}
