use axum::{
    async_trait,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use courier_engine::{ChatService, GroupUpdate, MessageEdit, NewGroup, NewMessage, SendOutcome};
use courier_shared::constants::MAX_FRAME_SIZE;
use courier_shared::{GroupId, MessageId, UserId};
use courier_store::{Group, MemberRole, Message};

use crate::error::ServerError;
use crate::ws;

/// Header carrying the caller's identity, set by the fronting auth proxy.
pub const USER_HEADER: &str = "x-user-email";

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/groups", get(list_groups).post(create_group))
        .route(
            "/groups/:id",
            get(get_group).patch(update_group).delete(delete_group),
        )
        .route("/groups/:id/members", post(add_member))
        .route("/groups/:id/members/:user", delete(remove_member))
        .route("/groups/:id/messages", get(list_messages).post(send_message))
        .route("/groups/:id/read", post(mark_read))
        .route("/groups/:id/unread", get(unread_count))
        .route("/groups/:id/active", get(active_members))
        .route("/messages/:id", patch(edit_message).delete(delete_message))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

/// The authenticated caller, taken from [`USER_HEADER`].
pub struct Caller(pub UserId);

fn header_identity(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::from)
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_identity(&parts.headers)
            .map(Caller)
            .ok_or(ServerError::Unauthenticated)
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online: usize,
}

#[derive(Deserialize)]
struct WsQuery {
    user: Option<String>,
}

#[derive(Deserialize)]
struct AddMemberRequest {
    user_email: UserId,
    #[serde(default = "default_role")]
    role: MemberRole,
}

fn default_role() -> MemberRole {
    MemberRole::Member
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    before: Option<MessageId>,
    /// Switches the listing to a content search.
    q: Option<String>,
    #[serde(default)]
    skip: usize,
}

#[derive(Deserialize)]
struct MarkReadRequest {
    message_ids: Vec<MessageId>,
}

#[derive(Serialize)]
struct MarkReadResponse {
    marked: Vec<MessageId>,
}

#[derive(Serialize)]
struct UnreadResponse {
    group_id: GroupId,
    count: usize,
}

#[derive(Serialize)]
struct ActiveMembersResponse {
    group_id: GroupId,
    members: Vec<UserId>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: state.service.hub().online_count().await,
    })
}

/// Upgrade to the real-time channel. Identity comes from the header or,
/// for browsers that cannot set headers on upgrade, the `user` query param.
/// The identity is checked before the handshake is accepted.
async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ServerError> {
    let user = header_identity(&headers)
        .or_else(|| {
            query
                .user
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .map(UserId)
        })
        .ok_or(ServerError::Unauthenticated)?;

    let hub = state.service.hub().clone();
    hub.check_identity(&user).await?;

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(upgrade
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = ws::split(socket);
            match hub.admit(user.clone(), sink, stream).await {
                Ok(()) => info!(user = %user, "websocket admitted"),
                Err(e) => warn!(user = %user, error = %e, "websocket rejected"),
            }
        }))
}

async fn list_groups(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Result<Json<Vec<Group>>, ServerError> {
    Ok(Json(state.service.list_groups(&user).await?))
}

async fn create_group(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(req): Json<NewGroup>,
) -> Result<(StatusCode, Json<Group>), ServerError> {
    let group = state.service.create_group(&user, req).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_group(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
) -> Result<Json<Group>, ServerError> {
    Ok(Json(state.service.get_group(&user, id).await?))
}

async fn update_group(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
    Json(update): Json<GroupUpdate>,
) -> Result<Json<Group>, ServerError> {
    Ok(Json(state.service.update_group(&user, id, update).await?))
}

async fn delete_group(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
) -> Result<StatusCode, ServerError> {
    state.service.delete_group(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_member(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
    Json(req): Json<AddMemberRequest>,
) -> Result<StatusCode, ServerError> {
    state
        .service
        .add_member(&user, id, req.user_email, req.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path((id, member)): Path<(GroupId, UserId)>,
) -> Result<StatusCode, ServerError> {
    state.service.remove_member(&user, id, &member).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let messages = match query.q {
        Some(q) => {
            if query.before.is_some() {
                return Err(ServerError::BadRequest(
                    "`before` cannot be combined with a search".into(),
                ));
            }
            state
                .service
                .search(&user, id, &q, query.limit, query.skip)
                .await?
        }
        None => {
            state
                .service
                .history(&user, id, query.limit, query.before)
                .await?
        }
    };
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
    Json(draft): Json<NewMessage>,
) -> Result<(StatusCode, Json<SendOutcome>), ServerError> {
    let outcome = state.service.send_message(&user, id, draft).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn edit_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<MessageId>,
    Json(edit): Json<MessageEdit>,
) -> Result<Json<Message>, ServerError> {
    Ok(Json(state.service.edit_message(&user, id, edit).await?))
}

async fn delete_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<MessageId>,
) -> Result<StatusCode, ServerError> {
    state.service.delete_message(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_read(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let marked = state.service.mark_read(&user, id, &req.message_ids).await?;
    Ok(Json(MarkReadResponse { marked }))
}

async fn unread_count(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
) -> Result<Json<UnreadResponse>, ServerError> {
    let count = state.service.unread_count(&user, id).await?;
    Ok(Json(UnreadResponse { group_id: id, count }))
}

async fn active_members(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<GroupId>,
) -> Result<Json<ActiveMembersResponse>, ServerError> {
    let members = state.service.active_members(&user, id).await?;
    Ok(Json(ActiveMembersResponse {
        group_id: id,
        members,
    }))
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
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use courier_engine::{ChatHub, HubConfig, IdentityDirectory, OpenDirectory, StaticDirectory};
    use courier_store::MemoryStore;

    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";
    const CAROL: &str = "carol@example.com";

    fn app() -> Router {
        app_with(Arc::new(OpenDirectory))
    }

    fn app_with(directory: Arc<dyn IdentityDirectory>) -> Router {
        let hub = ChatHub::new(Arc::new(MemoryStore::new()), directory, HubConfig::default());
        build_router(AppState {
            service: ChatService::new(hub),
        })
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header("x-user-email", user);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_group(app: &Router) -> String {
        let (status, group) = call(
            app,
            Method::POST,
            "/groups",
            Some(ALICE),
            Some(json!({ "name": "case room", "members": [BOB] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        group["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["online"], 0);
    }

    #[tokio::test]
    async fn test_ws_unknown_identity_is_rejected_before_upgrade() {
        let app = app_with(Arc::new(StaticDirectory::new([UserId::from(ALICE)])));

        let (status, body) = call(&app, Method::GET, "/ws?user=unknown", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("unknown"));

        let (status, _) = call(&app, Method::GET, "/ws", Some("mallory@example.com"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/ws", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, health) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(health["online"], 0);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/groups", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_message_flow_and_unread() {
        let app = app();
        let gid = create_group(&app).await;

        let (status, groups) = call(&app, Method::GET, "/groups", Some(BOB), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(groups.as_array().unwrap().len(), 1);

        let (status, outcome) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/messages"),
            Some(ALICE),
            Some(json!({ "content": "hello bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(outcome["live"].is_null());
        let mid = outcome["message"]["id"].as_str().unwrap().to_string();

        let (_, unread) = call(
            &app,
            Method::GET,
            &format!("/groups/{gid}/unread"),
            Some(BOB),
            None,
        )
        .await;
        assert_eq!(unread["count"], 1);

        let (status, read) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/read"),
            Some(BOB),
            Some(json!({ "message_ids": [mid] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["marked"].as_array().unwrap().len(), 1);

        let (_, unread) = call(
            &app,
            Method::GET,
            &format!("/groups/{gid}/unread"),
            Some(BOB),
            None,
        )
        .await;
        assert_eq!(unread["count"], 0);

        let (status, history) = call(
            &app,
            Method::GET,
            &format!("/groups/{gid}/messages?limit=10"),
            Some(BOB),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["content"], "hello bob");

        let (status, found) = call(
            &app,
            Method::GET,
            &format!("/groups/{gid}/messages?q=HELLO"),
            Some(ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_member_is_forbidden() {
        let app = app();
        let gid = create_group(&app).await;

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/messages"),
            Some(CAROL),
            Some(json!({ "content": "let me in" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, Method::GET, &format!("/groups/{gid}"), Some(CAROL), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_group_is_not_found() {
        let app = app();
        let gid = GroupId::new();
        let (status, body) = call(&app, Method::GET, &format!("/groups/{gid}"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("Not found"));
    }

    #[tokio::test]
    async fn test_empty_message_is_bad_request() {
        let app = app();
        let gid = create_group(&app).await;
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/messages"),
            Some(ALICE),
            Some(json!({ "content": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_member_management_and_group_delete() {
        let app = app();
        let gid = create_group(&app).await;

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/members"),
            Some(BOB),
            Some(json!({ "user_email": CAROL })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/members"),
            Some(ALICE),
            Some(json!({ "user_email": CAROL })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &app,
            Method::DELETE,
            &format!("/groups/{gid}/members/{CAROL}"),
            Some(CAROL),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, active) = call(
            &app,
            Method::GET,
            &format!("/groups/{gid}/active"),
            Some(ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(active["members"].as_array().unwrap().is_empty());

        let (status, _) = call(&app, Method::DELETE, &format!("/groups/{gid}"), Some(BOB), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, Method::DELETE, &format!("/groups/{gid}"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::GET, &format!("/groups/{gid}"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_edit_and_delete_message() {
        let app = app();
        let gid = create_group(&app).await;
        let (_, outcome) = call(
            &app,
            Method::POST,
            &format!("/groups/{gid}/messages"),
            Some(ALICE),
            Some(json!({ "content": "first draft" })),
        )
        .await;
        let mid = outcome["message"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            Method::PATCH,
            &format!("/messages/{mid}"),
            Some(BOB),
            Some(json!({ "content": "hijack" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, edited) = call(
            &app,
            Method::PATCH,
            &format!("/messages/{mid}"),
            Some(ALICE),
            Some(json!({ "content": "final" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(edited["content"], "final");

        let (status, _) = call(&app, Method::DELETE, &format!("/messages/{mid}"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, history) = call(
            &app,
            Method::GET,
            &format!("/groups/{gid}/messages"),
            Some(ALICE),
            None,
        )
        .await;
        assert!(history.as_array().unwrap().is_empty());
    }
}
