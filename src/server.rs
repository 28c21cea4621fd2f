//!
//! duit HTTP server
//! ----------------
//! Axum router for the duit API.
//!
//! Responsibilities:
//! - Session transport: `session-id` cookie or `Authorization: Bearer` token.
//! - An authorization gate in front of every `/api` route except logout;
//!   handlers only run after the configured policy allowed (identity,
//!   method, path).
//! - Login/logout and the user-management endpoints.
//! - Periodic sweep of expired sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::identity::{
    AuthError, Authenticator, Credential, MemorySessionStore, PolicyKind, Principal, RequestContext,
    SessionManager, SqlCredentialStore,
};
use crate::storage::{NewUser, SharedStore, UserUpdate};

pub const SESSION_COOKIE: &str = "session-id";

/// Shared state injected into all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub auth: Arc<Authenticator>,
}

impl AppState {
    pub fn new(store: SharedStore, sessions: SessionManager, policy: PolicyKind) -> Self {
        let credentials = Arc::new(SqlCredentialStore::new(store.clone()));
        let auth = Arc::new(Authenticator::new(credentials, sessions, policy.build()));
        Self { store, auth }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/login", post(login))
        .route("/api/users", get(select_users))
        .route("/api/users", delete(delete_users))
        .route("/api/user", post(insert_user))
        .route("/api/user", put(update_user))
        .route("/api/user/password", put(change_password))
        .route("/api/user/password/reset", put(reset_password))
        .route_layer(middleware::from_fn_with_state(state.clone(), gate));

    // Revoking a session must never depend on the policy.
    Router::new()
        .route("/", get(|| async { "duit ok" }))
        .route("/api/logout", post(logout))
        .merge(api)
        .with_state(state)
}

/// Open the store, build the authenticator and serve until ctrl-c.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let store = SharedStore::connect(&cfg.database)
        .await
        .with_context(|| format!("While opening database {}", cfg.database))?;
    store
        .ensure_default_admin()
        .await
        .context("While ensuring default admin")?;

    let sessions = SessionManager::new(Arc::new(MemorySessionStore::new()), cfg.session_ttl());
    let state = AppState::new(store.clone(), sessions, cfg.policy);
    if cfg.policy == PolicyKind::AllowAll {
        warn!(target: "startup", "authorization disabled: policy allow-all admits every request");
    }
    info!(
        target: "startup",
        policy = state.auth.policy_name(),
        session_ttl_secs = cfg.session_ttl_secs,
        database = %cfg.database,
        "duit configured"
    );

    if let Some(every) = cfg.sweep_interval() {
        spawn_session_sweeper(state.auth.clone(), every);
    }

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    info!("server stopped");
    Ok(())
}

fn spawn_session_sweeper(auth: Arc<Authenticator>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let removed = auth.sessions().purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "session_sweep");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {e}");
        std::future::pending::<()>().await;
    }
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all(header::COOKIE) {
        let Ok(s) = cookie.to_str() else { continue };
        for part in s.split(';') {
            if let Some((k, v)) = part.trim().split_once('=') {
                if k == name && !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

/// Bearer header wins over the cookie.
fn request_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| parse_cookie(headers, SESSION_COOKIE))
}

fn session_cookie(token: &str, max_age_secs: i64) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; Max-Age={max_age_secs}; HttpOnly; Secure; SameSite=Strict; Path=/"
    ))
    .map_err(|_| AppError::internal("internal", "invalid session cookie"))
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static(
        "session-id=deleted; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
    )
}

async fn gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let token = request_token(req.headers());

    let (identity, allowed) = state.auth.evaluate(token.as_deref(), &method, &path);
    if !allowed {
        let err = if identity.is_anonymous() {
            AppError::auth("unauthorized", "authentication required")
        } else {
            AppError::from(AuthError::Denied)
        };
        return err.into_response();
    }

    let span = tracing::info_span!("request", id = %request_id, %method, path = %path, user = identity.label());
    req.extensions_mut().insert(RequestContext { identity, request_id, token });
    next.run(req).instrument(span).await
}

fn require_principal(ctx: &RequestContext) -> AppResult<&Principal> {
    ctx.identity
        .principal()
        .ok_or_else(|| AppError::auth("unauthorized", "authentication required"))
}

fn required(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::UserInput {
            code: "bad_input".into(),
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResult {
    status: &'static str,
    token: String,
    user: Principal,
    expires_at: chrono::DateTime<chrono::Utc>,
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> AppResult<Response> {
    let cred = Credential::new(payload.username, payload.password);
    let session = state.auth.login(&cred).await?;
    let max_age = state.auth.sessions().ttl().num_seconds();

    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, session_cookie(&session.token, max_age)?);
    let body = LoginResult {
        status: "ok",
        token: session.token,
        user: session.principal,
        expires_at: session.expires_at,
    };
    Ok((StatusCode::OK, headers, Json(body)).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = request_token(&headers) {
        state.auth.logout(&token);
    }
    let mut h = HeaderMap::new();
    h.insert(header::SET_COOKIE, clear_session_cookie());
    (StatusCode::OK, h, Json(serde_json::json!({"status":"ok"})))
}

async fn select_users(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let users = state.store.list_users().await?;
    Ok(Json(users))
}

async fn insert_user(State(state): State<AppState>, Json(payload): Json<NewUser>) -> AppResult<impl IntoResponse> {
    required("username", &payload.username)?;
    required("name", &payload.name)?;
    required("password", &payload.password)?;
    let user = state.store.insert_user(&payload).await?;
    info!(target: "users", user = %user.username, admin = user.admin, "user created");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(State(state): State<AppState>, Json(payload): Json<UserUpdate>) -> AppResult<impl IntoResponse> {
    required("username", &payload.username)?;
    required("name", &payload.name)?;
    let user = state.store.update_user(&payload).await?;
    // live sessions carry the old name and role
    state.auth.revoke_user(user.id);
    Ok(Json(user))
}

async fn delete_users(State(state): State<AppState>, Json(ids): Json<Vec<i64>>) -> AppResult<impl IntoResponse> {
    let deleted = state.store.delete_users(&ids).await?;
    for id in &ids {
        state.auth.revoke_user(*id);
    }
    info!(target: "users", deleted, "users deleted");
    Ok(Json(serde_json::json!({"status":"ok","deleted": deleted})))
}

#[derive(Debug, Deserialize)]
struct PasswordChange {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(payload): Json<PasswordChange>,
) -> AppResult<Response> {
    let who = require_principal(&ctx)?;
    required("new_password", &payload.new_password)?;
    state
        .auth
        .change_password(who, &payload.old_password, &payload.new_password)
        .await?;
    let mut h = HeaderMap::new();
    h.insert(header::SET_COOKIE, clear_session_cookie());
    Ok((StatusCode::OK, h, Json(serde_json::json!({"status":"ok"}))).into_response())
}

#[derive(Debug, Deserialize)]
struct PasswordReset {
    id: i64,
}

async fn reset_password(State(state): State<AppState>, Json(payload): Json<PasswordReset>) -> AppResult<impl IntoResponse> {
    if state.store.get_user(payload.id).await?.is_none() {
        return Err(AppError::not_found("not_found", "user not found"));
    }
    let password = state.auth.reset_password(payload.id).await?;
    Ok(Json(serde_json::json!({"status":"ok","password": password})))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(k.clone(), HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn cookie_parsing() {
        let h = headers(&[(header::COOKIE, "theme=dark; session-id=abc123; other=x")]);
        assert_eq!(parse_cookie(&h, SESSION_COOKIE).as_deref(), Some("abc123"));
        let h = headers(&[(header::COOKIE, "session-id=")]);
        assert_eq!(parse_cookie(&h, SESSION_COOKIE), None);
        assert_eq!(parse_cookie(&HeaderMap::new(), SESSION_COOKIE), None);
    }

    #[test]
    fn bearer_takes_precedence_over_cookie() {
        let h = headers(&[
            (header::COOKIE, "session-id=from-cookie"),
            (header::AUTHORIZATION, "Bearer from-header"),
        ]);
        assert_eq!(request_token(&h).as_deref(), Some("from-header"));
        let h = headers(&[(header::AUTHORIZATION, "Basic dXNlcjpwYXNz"), (header::COOKIE, "session-id=c")]);
        assert_eq!(request_token(&h).as_deref(), Some("c"));
    }
}
