use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use base64::{Engine, engine::general_purpose::STANDARD};
use http::request::Parts;
use ras_oauth2_signin::{
    AeadStateProtector, AuthenticationProperties, HandshakeHandler, HandshakeOptions,
    OAuth2SignInConfig, StateProtector, callback_router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod session;

use session::{JwtCookieSignIn, SESSION_SCHEME};

/// Configuration for the sign-in demo
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: OAuth2SignInConfig,
    /// Base64 master key for state protection; random per process when unset
    pub state_key: Option<Vec<u8>>,
    pub jwt_secret: String,
    pub server_host: String,
    pub server_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let provider = OAuth2SignInConfig::new(
            std::env::var("OAUTH2_CLIENT_ID")
                .context("OAUTH2_CLIENT_ID environment variable is required")?,
            std::env::var("OAUTH2_CLIENT_SECRET")
                .context("OAUTH2_CLIENT_SECRET environment variable is required")?,
            std::env::var("OAUTH2_AUTHORIZATION_ENDPOINT")
                .context("OAUTH2_AUTHORIZATION_ENDPOINT environment variable is required")?,
            std::env::var("OAUTH2_TOKEN_ENDPOINT")
                .context("OAUTH2_TOKEN_ENDPOINT environment variable is required")?,
            std::env::var("OAUTH2_USERINFO_ENDPOINT")
                .context("OAUTH2_USERINFO_ENDPOINT environment variable is required")?,
        )
        .with_callback_path(
            std::env::var("OAUTH2_CALLBACK_PATH").unwrap_or_else(|_| "/signin-oauth2".to_string()),
        )
        .with_scopes(
            std::env::var("OAUTH2_SCOPES")
                .unwrap_or_else(|_| "profile email".to_string())
                .split_whitespace(),
        )
        .with_authentication_type(
            std::env::var("OAUTH2_AUTHENTICATION_TYPE").unwrap_or_else(|_| "OAuth2".to_string()),
        )
        .with_sign_in_authentication_type(SESSION_SCHEME)
        .with_error_path("/signin-error");

        let state_key = std::env::var("OAUTH2_STATE_KEY")
            .ok()
            .map(|key| STANDARD.decode(key.trim()))
            .transpose()
            .context("OAUTH2_STATE_KEY must be base64")?;

        Ok(Self {
            provider,
            state_key,
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| "change-me-in-production-please".to_string()),
            server_host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
        })
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<HandshakeHandler>,
    pub sessions: Arc<JwtCookieSignIn>,
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    return_to: Option<String>,
}

fn create_handler(config: &AppConfig, sessions: Arc<JwtCookieSignIn>) -> Result<HandshakeHandler> {
    let state_protector: Option<Arc<dyn StateProtector>> = match &config.state_key {
        Some(key) => Some(Arc::new(
            AeadStateProtector::from_master_key(
                key,
                &[
                    "oauth2-signin-server",
                    &config.provider.authentication_type,
                    "v1",
                ],
            )
            .context("Invalid OAUTH2_STATE_KEY")?,
        )),
        None => None,
    };

    let options = HandshakeOptions::builder()
        .config(config.provider.clone())
        .maybe_state_protector(state_protector)
        .build();

    HandshakeHandler::new(options, sessions).context("Failed to create OAuth2 sign-in handler")
}

/// Handler for the root page
async fn index_handler(State(state): State<AppState>, jar: CookieJar) -> Html<String> {
    let body = match state.sessions.current(&jar) {
        Some(claims) => format!(
            r#"<p>Signed in as <strong>{}</strong> ({})</p><a href="/logout">Sign out</a>"#,
            claims.name.as_deref().unwrap_or(&claims.sub),
            claims.email.as_deref().unwrap_or("no email")
        ),
        None => r#"<p>Not signed in.</p><a href="/login">Sign in</a>"#.to_string(),
    };

    Html(format!(
        "<!DOCTYPE html><html><head><title>OAuth2 sign-in</title></head><body><h1>OAuth2 sign-in demo</h1>{}</body></html>",
        body
    ))
}

/// Handler to start the handshake
async fn login_handler(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    parts: Parts,
) -> Response {
    let properties = AuthenticationProperties::with_redirect_uri(
        query.return_to.unwrap_or_else(|| "/".to_string()),
    );

    match state.handler.challenge(&parts, properties).await {
        Ok(challenge) => challenge.into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn logout_handler(jar: CookieJar) -> (CookieJar, Redirect) {
    (
        jar.add(JwtCookieSignIn::removal_cookie()),
        Redirect::to("/"),
    )
}

/// Handler for error page
async fn signin_error_handler(Query(params): Query<HashMap<String, String>>) -> Html<String> {
    let code = params.get("error").map(String::as_str).unwrap_or("unknown");
    let message = match code {
        "access_denied" => "Sign-in was cancelled or denied by the identity provider.",
        "invalid_state" => "The sign-in request was invalid or has expired.",
        "backchannel_failure" => "The identity provider could not be reached.",
        _ => "Sign-in could not be completed.",
    };

    Html(format!(
        "<!DOCTYPE html><html><head><title>Sign-in failed</title></head><body><h1>Sign-in failed</h1><p>{}</p><a href=\"/login\">Try again</a></body></html>",
        message
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ras_oauth2_signin=debug")),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!("Starting OAuth2 sign-in demo server");

    let sessions = Arc::new(JwtCookieSignIn::new(
        &config.jwt_secret,
        chrono::Duration::hours(8),
    ));
    let handler = Arc::new(create_handler(&config, sessions.clone())?);

    if config.state_key.is_none() {
        warn!("OAUTH2_STATE_KEY not set; sign-ins in flight will not survive a restart");
    }

    let state = AppState {
        handler: handler.clone(),
        sessions,
    };

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_handler))
        .route("/logout", get(logout_handler))
        .route("/signin-error", get(signin_error_handler))
        .with_state(state)
        .merge(callback_router(handler.clone()));

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!("Server running on http://{}", bind_addr);
    info!(
        "OAuth2 callback: http://{}{}",
        bind_addr,
        handler.callback_path()
    );

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
