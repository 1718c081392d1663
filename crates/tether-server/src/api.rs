use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use tether_bridge::query::{ContextWindow, MessageHit};
use tether_bridge::{Bridge, SendOutcome, SessionState};
use tether_shared::{ChatJid, ContentKind};
use tether_store::{Chat, ChatFilter, ChatSort, ChatSummary, Contact, Message, MessageContext, MessageFilter};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/session", get(session_status))
        .route("/api/session/unlink", post(session_unlink))
        .route("/api/send", post(send_message))
        .route("/api/send-file", post(send_file))
        .route("/api/send-audio", post(send_audio))
        .route("/api/download", post(download_media))
        .route("/api/contacts", get(search_contacts))
        .route("/api/contacts/:jid/direct-chat", get(direct_chat))
        .route("/api/contacts/:jid/chats", get(contact_chats))
        .route("/api/contacts/:jid/last-interaction", get(last_interaction))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/:id/context", get(message_context))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/:jid", get(get_chat))
        .route("/api/recent-messages", get(recent_messages))
        .route("/api/search", get(search_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn default_limit() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_context() -> u32 {
    1
}

fn default_wide_context() -> u32 {
    5
}

// ─── Session ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct SessionResponse {
    paired: bool,
    #[serde(flatten)]
    state: SessionState,
}

#[derive(Serialize)]
struct AckResponse {
    success: bool,
    message: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn session_status(State(state): State<AppState>) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.bridge.session();
    Ok(Json(SessionResponse {
        paired: session.is_paired()?,
        state: session.state(),
    }))
}

async fn session_unlink(State(state): State<AppState>) -> Result<Json<AckResponse>, ApiError> {
    state.bridge.session().unlink().await?;
    info!("Device unlinked via API");
    Ok(Json(AckResponse {
        success: true,
        message: "Device unlinked".into(),
    }))
}

// ─── Commands ───

#[derive(Deserialize)]
struct SendMessageRequest {
    recipient: String,
    message: String,
}

#[derive(Deserialize)]
struct SendFileRequest {
    recipient: String,
    media_path: PathBuf,
    #[serde(default)]
    kind: Option<ContentKind>,
}

#[derive(Deserialize)]
struct SendAudioRequest {
    recipient: String,
    media_path: PathBuf,
}

#[derive(Deserialize)]
struct DownloadRequest {
    message_id: String,
    #[serde(default)]
    chat_jid: Option<String>,
}

#[derive(Serialize)]
struct SendResponse {
    success: bool,
    message: String,
    #[serde(flatten)]
    outcome: SendOutcome,
}

#[derive(Serialize)]
struct DownloadResponse {
    success: bool,
    message: String,
    file_path: PathBuf,
}

impl SendResponse {
    fn new(what: &str, outcome: SendOutcome) -> Self {
        Self {
            success: true,
            message: format!("{what} sent to {}", outcome.chat_jid),
            outcome,
        }
    }
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    if req.message.is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let outcome = state.bridge.gateway().send_text(&req.recipient, &req.message).await?;
    Ok(Json(SendResponse::new("Message", outcome)))
}

async fn send_file(
    State(state): State<AppState>,
    Json(req): Json<SendFileRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let outcome = state
        .bridge
        .gateway()
        .send_media(&req.recipient, &req.media_path, req.kind)
        .await?;
    Ok(Json(SendResponse::new("File", outcome)))
}

async fn send_audio(
    State(state): State<AppState>,
    Json(req): Json<SendAudioRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let outcome = state.bridge.gateway().send_voice(&req.recipient, &req.media_path).await?;
    Ok(Json(SendResponse::new("Voice message", outcome)))
}

async fn download_media(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let file_path = state
        .bridge
        .gateway()
        .download_media(&req.message_id, req.chat_jid.as_deref())
        .await?;
    Ok(Json(DownloadResponse {
        success: true,
        message: "Media downloaded".into(),
        file_path,
    }))
}

// ─── Queries ───

#[derive(Deserialize)]
struct ContactSearchParams {
    #[serde(default)]
    query: String,
}

#[derive(Deserialize)]
struct MessagesParams {
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
    sender: Option<String>,
    chat_jid: Option<String>,
    query: Option<String>,
    kind: Option<ContentKind>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_true")]
    include_context: bool,
    #[serde(default = "default_context")]
    context_before: u32,
    #[serde(default = "default_context")]
    context_after: u32,
}

#[derive(Deserialize)]
struct ContextParams {
    chat_jid: Option<String>,
    #[serde(default = "default_wide_context")]
    before: u32,
    #[serde(default = "default_wide_context")]
    after: u32,
}

#[derive(Deserialize)]
struct ChatsParams {
    query: Option<String>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_true")]
    include_last_message: bool,
    #[serde(default)]
    sort_by: ChatSort,
}

#[derive(Deserialize)]
struct ChatParams {
    #[serde(default = "default_true")]
    include_last_message: bool,
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    page: u32,
}

#[derive(Deserialize)]
struct SearchParams {
    keyword: String,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    page: u32,
}

async fn search_contacts(
    State(state): State<AppState>,
    Query(params): Query<ContactSearchParams>,
) -> Result<Json<Vec<Contact>>, ApiError> {
    Ok(Json(state.bridge.query().search_contacts(&params.query)?))
}

async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<MessagesParams>,
) -> Result<Json<Vec<MessageHit>>, ApiError> {
    let filter = MessageFilter {
        after: params.after,
        before: params.before,
        sender: params.sender,
        chat_jid: params.chat_jid.as_deref().map(ChatJid::parse).transpose()?,
        query: params.query,
        kind: params.kind,
        limit: params.limit,
        page: params.page,
    };
    let context = params.include_context.then_some(ContextWindow {
        before: params.context_before,
        after: params.context_after,
    });
    Ok(Json(state.bridge.query().list_messages(&filter, context)?))
}

async fn message_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ContextParams>,
) -> Result<Json<MessageContext>, ApiError> {
    let ctx = state.bridge.query().get_message_context(
        &id,
        params.chat_jid.as_deref(),
        params.before,
        params.after,
    )?;
    Ok(Json(ctx))
}

async fn list_chats(
    State(state): State<AppState>,
    Query(params): Query<ChatsParams>,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    let filter = ChatFilter {
        query: params.query,
        limit: params.limit,
        page: params.page,
        include_last_message: params.include_last_message,
        sort_by: params.sort_by,
    };
    Ok(Json(state.bridge.query().list_chats(&filter)?))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(jid): Path<String>,
    Query(params): Query<ChatParams>,
) -> Result<Json<ChatSummary>, ApiError> {
    Ok(Json(state.bridge.query().get_chat(&jid, params.include_last_message)?))
}

async fn direct_chat(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> Result<Json<ChatSummary>, ApiError> {
    Ok(Json(state.bridge.query().get_direct_chat_by_contact(&phone)?))
}

async fn contact_chats(
    State(state): State<AppState>,
    Path(jid): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<Chat>>, ApiError> {
    Ok(Json(state.bridge.query().get_contact_chats(&jid, params.limit, params.page)?))
}

async fn last_interaction(
    State(state): State<AppState>,
    Path(jid): Path<String>,
) -> Result<Json<Message>, ApiError> {
    state
        .bridge
        .query()
        .get_last_interaction(&jid)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No interactions found with {jid}")))
}

async fn recent_messages(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    Ok(Json(state.bridge.query().recent_messages_per_chat(params.limit)?))
}

async fn search_messages(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(
        state
            .bridge
            .query()
            .search_messages(&params.keyword, params.limit, params.page)?,
    ))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use tether_bridge::test_support::{test_credentials, ScriptedTransport};
    use tether_bridge::{BridgeConfig, SystemClock};
    use tether_store::Database;

    const ALICE: &str = "31600000001@s.whatsapp.net";

    struct Fixture {
        app: Router,
        transport: Arc<ScriptedTransport>,
        _dir: TempDir,
    }

    async fn fixture(connected: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        if connected {
            db.write_batch(|b| b.save_session(&test_credentials(), 0)).unwrap();
        }
        let transport = Arc::new(ScriptedTransport::new());
        let config = BridgeConfig {
            store_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let bridge = Bridge::with_database(config, db, transport.clone(), Arc::new(SystemClock))
            .await
            .unwrap();
        if connected {
            bridge.session().connect().await.unwrap();
        }

        Fixture {
            app: build_router(AppState {
                bridge: Arc::new(bridge),
            }),
            transport,
            _dir: dir,
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let fx = fixture(false).await;
        let (status, body) = call(&fx.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn send_without_session_is_unavailable() {
        let fx = fixture(false).await;
        let (status, body) = call(&fx.app, post("/api/send", json!({ "recipient": ALICE, "message": "hi" }))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("no active session"));
        assert!(fx.transport.sent().is_empty());

        let (_, session) = call(&fx.app, get("/api/session")).await;
        assert_eq!(session["paired"], false);
        assert_eq!(session["state"], "unpaired");
    }

    #[tokio::test]
    async fn sent_message_is_immediately_queryable() {
        let fx = fixture(true).await;
        let (status, body) = call(
            &fx.app,
            post("/api/send", json!({ "recipient": "+31600000001", "message": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message_id"], "SENT0");
        assert_eq!(body["chat_jid"], ALICE);

        let (status, messages) = call(
            &fx.app,
            get(&format!("/api/messages?chat_jid={ALICE}&include_context=false")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages.as_array().unwrap().len(), 1);
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[0]["is_from_me"], true);

        let (status, chat) = call(&fx.app, get(&format!("/api/chats/{ALICE}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chat["last_message"]["id"], "SENT0");
    }

    #[tokio::test]
    async fn bad_input_is_rejected_with_reason() {
        let fx = fixture(true).await;

        let (status, body) = call(&fx.app, post("/api/send", json!({ "recipient": "12ab", "message": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(&fx.app, get("/api/chats/404@s.whatsapp.net")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = call(&fx.app, get("/api/contacts?query=")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&fx.app, get(&format!("/api/contacts/{ALICE}/last-interaction"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_media_download_is_not_found() {
        let fx = fixture(true).await;
        let (status, body) = call(&fx.app, post("/api/download", json!({ "message_id": "nope" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(fx.transport.fetches(), 0);
    }
}
