//! axum integration: the callback route and response rendering.

use crate::error::HandshakeFailure;
use crate::handler::{Challenge, CompletedHandshake, HandshakeHandler};
use axum::Router;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use std::sync::Arc;

/// Router serving `GET <callback_path>` for the given handler.
///
/// Merge it into the application router; the challenge side is started by
/// application code calling [`HandshakeHandler::challenge`].
pub fn callback_router<S>(handler: Arc<HandshakeHandler>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let path = handler.callback_path().to_string();
    Router::new()
        .route(&path, get(callback))
        .with_state(handler)
}

async fn callback(State(handler): State<Arc<HandshakeHandler>>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    handler.handle_callback(&parts).await.into_response()
}

fn redirect(location: &str, set_cookies: Vec<HeaderValue>, extra: HeaderMap) -> Response {
    let Ok(location) = HeaderValue::from_str(location) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    for (name, value) in extra.iter() {
        headers.append(name, value.clone());
    }
    for cookie in set_cookies {
        headers.append(header::SET_COOKIE, cookie);
    }
    headers.insert(header::LOCATION, location);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

impl IntoResponse for Challenge {
    fn into_response(self) -> Response {
        redirect(&self.location, self.set_cookies, HeaderMap::new())
    }
}

impl IntoResponse for CompletedHandshake {
    fn into_response(self) -> Response {
        redirect(&self.redirect_uri, self.set_cookies, self.sign_in_headers)
    }
}

impl IntoResponse for HandshakeFailure {
    fn into_response(self) -> Response {
        if let Some(error_path) = &self.error_path {
            let separator = if error_path.contains('?') { '&' } else { '?' };
            let location = format!("{}{}error={}", error_path, separator, self.kind.code());
            return redirect(&location, self.set_cookies, HeaderMap::new());
        }

        let mut response = (self.kind.status(), self.kind.user_message()).into_response();
        for cookie in self.set_cookies {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
        response
    }
}
